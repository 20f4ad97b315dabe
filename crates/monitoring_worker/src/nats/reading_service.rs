use crate::domain::HourlyAggregator;
use crate::nats::dto::ReadingMessage;
use common::nats::{ConsumeRequest, ConsumeResponse};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, error, warn};

/// Tower service feeding raw readings into the hourly aggregator.
///
/// - Undecodable or invalid readings are terminated (dead-lettered)
/// - Store failures are nak'd for redelivery
/// - Every other outcome, including unknown devices, is acked
#[derive(Clone)]
pub struct ReadingConsumerService {
    aggregator: Arc<HourlyAggregator>,
}

impl ReadingConsumerService {
    pub fn new(aggregator: Arc<HourlyAggregator>) -> Self {
        Self { aggregator }
    }
}

impl Service<ConsumeRequest> for ReadingConsumerService {
    type Response = ConsumeResponse;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<ConsumeResponse, anyhow::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let aggregator = Arc::clone(&self.aggregator);

        Box::pin(async move {
            let message: ReadingMessage = match serde_json::from_slice(&req.payload) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, subject = %req.subject, "failed to decode reading");
                    return Ok(ConsumeResponse::term(format!("malformed reading: {e}")));
                }
            };

            let reading = match message.into_domain() {
                Ok(reading) => reading,
                Err(e) => {
                    error!(error = %e, subject = %req.subject, "rejecting invalid reading");
                    return Ok(ConsumeResponse::term(e.to_string()));
                }
            };
            let device_id = reading.device_id.clone();

            match aggregator.ingest(reading).await {
                Ok(outcome) => {
                    debug!(device_id = %device_id, outcome = ?outcome, "reading processed");
                    Ok(ConsumeResponse::ack())
                }
                Err(e) if e.is_permanent() => {
                    error!(error = %e, device_id = %device_id, "reading can never be processed");
                    Ok(ConsumeResponse::term(e.to_string()))
                }
                Err(e) => {
                    warn!(error = %e, device_id = %device_id, "failed to process reading");
                    Ok(ConsumeResponse::nak(e.to_string()))
                }
            }
        })
    }
}
