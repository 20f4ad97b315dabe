use crate::nats::dto::{NotificationMessage, OWNER_ID_HEADER};
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, Notification, NotificationProducer};
use common::nats::{traced_publisher, JetStreamPublisher, PublishRequest, TracedPublisher};
use std::sync::Arc;
use tower::ServiceExt;
use tracing::debug;

/// Publishes notifications to `{subject_prefix}.{owner_id}`
pub struct NatsNotificationProducer {
    publisher: TracedPublisher,
    subject_prefix: String,
}

impl NatsNotificationProducer {
    pub fn new(jetstream: Arc<dyn JetStreamPublisher>, subject_prefix: String) -> Self {
        debug!(subject_prefix = %subject_prefix, "initialized notification producer");

        Self {
            publisher: traced_publisher(jetstream, "notification_producer"),
            subject_prefix,
        }
    }

    pub fn subject_for(&self, owner_id: &str) -> String {
        format!("{}.{}", self.subject_prefix, subject_token(owner_id))
    }
}

/// Owner ids become a single subject token. Separator, wildcard and
/// whitespace characters are percent-encoded along with `%` itself, so
/// distinct owners never share a subject.
fn subject_token(value: &str) -> String {
    let mut token = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '.' | '*' | '>') || c.is_whitespace() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                token.push_str(&format!("%{byte:02X}"));
            }
        } else {
            token.push(c);
        }
    }
    token
}

#[async_trait]
impl NotificationProducer for NatsNotificationProducer {
    async fn publish_notification(&self, notification: &Notification) -> DomainResult<()> {
        let payload = serde_json::to_vec(&NotificationMessage::from(notification))
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let request = PublishRequest::new(self.subject_for(&notification.owner_id), payload)
            .with_header(OWNER_ID_HEADER, &notification.owner_id);

        self.publisher
            .clone()
            .oneshot(request)
            .await
            .map_err(DomainError::RepositoryError)?;
        Ok(())
    }
}
