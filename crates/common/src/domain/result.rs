use chrono::{DateTime, Utc};
use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Hourly aggregate already exists for device {device_id} at {hour_bucket_start}")]
    AggregateAlreadyExists {
        device_id: String,
        hour_bucket_start: DateTime<Utc>,
    },

    #[error("Invalid device event: {0}")]
    InvalidDeviceEvent(String),

    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    #[error("Invalid history request: {0}")]
    InvalidHistoryRequest(String),

    #[error("Notification queue full, dropped alert for device {0}")]
    NotificationQueueFull(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl DomainError {
    /// Errors caused by the message itself; redelivering it cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DomainError::InvalidDeviceEvent(_)
                | DomainError::InvalidReading(_)
                | DomainError::InvalidHistoryRequest(_)
                | DomainError::ValidationError(_)
        )
    }
}
