use crate::nats::{traced_publisher, ConsumeRequest, JetStreamPublisher, PublishRequest, TracedPublisher};
use anyhow::{Context, Result};
use std::sync::Arc;
use tower::ServiceExt;
use tracing::warn;

pub const DEAD_LETTER_ORIGIN_HEADER: &str = "Dead-Letter-Origin";
pub const DEAD_LETTER_SUBJECT_HEADER: &str = "Dead-Letter-Subject";
pub const DEAD_LETTER_REASON_HEADER: &str = "Dead-Letter-Reason";

/// Copies unprocessable messages to `{stream}.{origin}` with the rejection reason
#[derive(Clone)]
pub struct DeadLetterPublisher {
    publisher: TracedPublisher,
    origin: String,
    subject: String,
}

impl DeadLetterPublisher {
    pub fn new(jetstream: Arc<dyn JetStreamPublisher>, stream: &str, origin: &str) -> Self {
        Self {
            publisher: traced_publisher(jetstream, format!("{origin}_dead_letters")),
            origin: origin.to_string(),
            subject: format!("{stream}.{origin}"),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn publish(&self, original: &ConsumeRequest, reason: &str) -> Result<()> {
        warn!(
            origin = %self.origin,
            subject = %original.subject,
            reason = %reason,
            "dead-lettering message"
        );

        let request = PublishRequest::new(self.subject.clone(), original.payload.clone())
            .with_header(DEAD_LETTER_ORIGIN_HEADER, &self.origin)
            .with_header(DEAD_LETTER_SUBJECT_HEADER, &original.subject)
            .with_header(DEAD_LETTER_REASON_HEADER, &header_safe(reason));

        self.publisher
            .clone()
            .oneshot(request)
            .await
            .with_context(|| format!("failed to publish dead letter to {}", self.subject))?;
        Ok(())
    }
}

/// Header values cannot span lines
fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}
