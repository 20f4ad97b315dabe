use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use super::types::{PublishRequest, PublishResponse};
use super::{NatsPublishTracingConfig, NatsPublishTracingLayer, NatsPublishTracingService};
use crate::nats::JetStreamPublisher;
use anyhow::Result;
use tower::{Service, ServiceBuilder};
use tracing::{debug, error};

/// Innermost service performing the JetStream publish. Logs the server
/// acknowledgment latency.
#[derive(Clone)]
pub struct NatsPublishService {
    publisher: Arc<dyn JetStreamPublisher>,
}

impl NatsPublishService {
    pub fn new(publisher: Arc<dyn JetStreamPublisher>) -> Self {
        Self { publisher }
    }
}

impl Service<PublishRequest> for NatsPublishService {
    type Response = PublishResponse;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let publisher = Arc::clone(&self.publisher);

        Box::pin(async move {
            let subject = req.subject;
            let payload_bytes = req.payload.len();
            let start = Instant::now();

            let result = publisher
                .publish_with_headers(subject.clone(), req.headers, req.payload)
                .await;
            let duration_ms = start.elapsed().as_millis();

            match result {
                Ok(()) => {
                    debug!(%subject, payload_bytes, duration_ms, "publish acknowledged");
                    Ok(PublishResponse { subject })
                }
                Err(e) => {
                    error!(%subject, payload_bytes, duration_ms, error = %e, "publish failed");
                    Err(e)
                }
            }
        })
    }
}

/// Publish stack used by every producer
pub type TracedPublisher = NatsPublishTracingService<NatsPublishService>;

pub fn traced_publisher(
    publisher: Arc<dyn JetStreamPublisher>,
    publisher_name: impl Into<String>,
) -> TracedPublisher {
    ServiceBuilder::new()
        .layer(NatsPublishTracingLayer::new(NatsPublishTracingConfig::new(
            publisher_name,
        )))
        .service(NatsPublishService::new(publisher))
}
