use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

/// Readings must fall in years 1..=9999 so every store can hold them
const MIN_READING_YEAR: i32 = 1;
const MAX_READING_YEAR: i32 = 9999;

/// A cumulative meter reading as delivered by a device
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub cumulative_value: f64,
}

impl RawReading {
    /// Build a reading from its wire representation (epoch milliseconds)
    pub fn from_epoch_millis(
        device_id: impl Into<String>,
        epoch_millis: i64,
        cumulative_value: f64,
    ) -> DomainResult<Self> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(DomainError::InvalidReading("empty device id".to_string()));
        }
        if !cumulative_value.is_finite() {
            return Err(DomainError::InvalidReading(format!(
                "non-finite value for device {device_id}"
            )));
        }
        let timestamp = DateTime::from_timestamp_millis(epoch_millis)
            .filter(|t| (MIN_READING_YEAR..=MAX_READING_YEAR).contains(&t.year()))
            .ok_or_else(|| {
                DomainError::InvalidReading(format!("timestamp out of range: {epoch_millis}"))
            })?;

        Ok(Self {
            device_id,
            timestamp,
            cumulative_value,
        })
    }
}

/// Half-open time window `[start, end)` of readings for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingWindowRepoInput {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Append-only log of raw readings, unique on (device_id, timestamp)
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RawReadingRepository: Send + Sync {
    /// Store a reading; returns false when an identical key was already stored
    async fn insert_reading(&self, reading: &RawReading) -> DomainResult<bool>;

    /// Readings inside the window, ordered by timestamp ascending
    async fn list_readings(&self, input: ReadingWindowRepoInput) -> DomainResult<Vec<RawReading>>;

    /// Whether the device has any stored reading strictly earlier than `before`
    async fn has_readings_before(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> DomainResult<bool>;
}
