use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::nats::{ConsumeRequest, ConsumeResponse};
use tower::{Layer, Service};
use tracing::{debug, error, warn, Instrument, Span};

/// Messages taking longer than this are reported at warn level
const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(1);

/// Tower layer logging how each consumed message was settled.
///
/// Acks log at debug (readings arrive continuously), naks and terms at warn
/// with their reason, and service errors at error.
#[derive(Clone)]
pub struct NatsConsumeLoggingLayer {
    slow_threshold: Duration,
}

impl Default for NatsConsumeLoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl NatsConsumeLoggingLayer {
    pub fn new() -> Self {
        Self {
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }

    pub fn with_slow_threshold(mut self, slow_threshold: Duration) -> Self {
        self.slow_threshold = slow_threshold;
        self
    }
}

impl<S> Layer<S> for NatsConsumeLoggingLayer {
    type Service = NatsConsumeLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsConsumeLoggingService {
            inner: service,
            slow_threshold: self.slow_threshold,
        }
    }
}

#[derive(Clone)]
pub struct NatsConsumeLoggingService<S> {
    inner: S,
    slow_threshold: Duration,
}

impl<S> Service<ConsumeRequest> for NatsConsumeLoggingService<S>
where
    S: Service<ConsumeRequest, Response = ConsumeResponse> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let subject = req.subject.clone();
        let payload_bytes = req.payload.len();
        let slow_threshold = self.slow_threshold;
        let start = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let elapsed = start.elapsed();
                let duration_ms = elapsed.as_millis();

                match &result {
                    Ok(ConsumeResponse::Ack) if elapsed > slow_threshold => {
                        warn!(%subject, payload_bytes, duration_ms, "slow message acked");
                    }
                    Ok(ConsumeResponse::Ack) => {
                        debug!(%subject, payload_bytes, duration_ms, "message acked");
                    }
                    Ok(ConsumeResponse::Nak(reason)) => {
                        warn!(
                            %subject,
                            payload_bytes,
                            duration_ms,
                            reason = reason.as_deref().unwrap_or("unspecified"),
                            "message nak'd for redelivery"
                        );
                    }
                    Ok(ConsumeResponse::Term(reason)) => {
                        warn!(%subject, payload_bytes, duration_ms, %reason, "message terminated");
                    }
                    Err(e) => {
                        error!(%subject, payload_bytes, duration_ms, error = %e, "message handler failed");
                    }
                }

                result
            }
            .instrument(Span::current()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    fn request() -> ConsumeRequest {
        ConsumeRequest::new(
            "meter_readings.in".to_string(),
            Bytes::from_static(b"{}"),
            None,
        )
    }

    #[tokio::test]
    async fn test_passes_responses_through() {
        for expected in [
            ConsumeResponse::ack(),
            ConsumeResponse::nak("store down"),
            ConsumeResponse::term("bad json"),
        ] {
            let response = expected.clone();
            let service = NatsConsumeLoggingLayer::new().layer(service_fn(move |_: ConsumeRequest| {
                let response = response.clone();
                async move { Ok::<_, Infallible>(response) }
            }));

            assert_eq!(service.oneshot(request()).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_passes_errors_through() {
        let service = NatsConsumeLoggingLayer::new()
            .with_slow_threshold(Duration::ZERO)
            .layer(service_fn(|_: ConsumeRequest| async { Err::<ConsumeResponse, _>("boom") }));

        assert_eq!(service.oneshot(request()).await.unwrap_err(), "boom");
    }
}
