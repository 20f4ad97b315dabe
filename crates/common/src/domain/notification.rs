use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Threshold breach to deliver to a device owner
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub owner_id: String,
    pub device_id: String,
    pub hour_bucket_start: DateTime<Utc>,
    pub consumption_delta: f64,
}

/// Publishes notifications onto the owner's channel
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationProducer: Send + Sync {
    async fn publish_notification(&self, notification: &Notification) -> DomainResult<()>;
}
