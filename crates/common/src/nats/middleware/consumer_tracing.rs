use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::nats::trace_context::extract_trace_context;
use crate::nats::{ConsumeRequest, ConsumeResponse};
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Configuration for consumer tracing middleware
#[derive(Clone, Debug, Default)]
pub struct NatsConsumeTracingConfig {
    pub consumer_name: String,
}

impl NatsConsumeTracingConfig {
    pub fn new(consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
        }
    }
}

/// Tower layer opening a `nats_consume` span per message, parented to the
/// publisher's trace when the message carries W3C headers
#[derive(Clone)]
pub struct NatsConsumeTracingLayer {
    config: NatsConsumeTracingConfig,
}

impl NatsConsumeTracingLayer {
    pub fn new(config: NatsConsumeTracingConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for NatsConsumeTracingLayer {
    type Service = NatsConsumeTracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsConsumeTracingService {
            inner: service,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct NatsConsumeTracingService<S> {
    inner: S,
    config: NatsConsumeTracingConfig,
}

impl<S> Service<ConsumeRequest> for NatsConsumeTracingService<S>
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
        let span = info_span!(
            target: "nats",
            "nats_consume",
            otel.name = %format!("{} receive", req.subject),
            messaging.system = "nats",
            messaging.operation = "receive",
            messaging.destination.name = %req.subject,
            messaging.consumer.name = %self.config.consumer_name,
            messaging.message.body.size = req.payload.len(),
            messaging.outcome = field::Empty,
            otel.status_code = field::Empty,
        );

        if let Some(headers) = &req.headers {
            span.set_parent(extract_trace_context(headers));
        }

        let mut inner = self.inner.clone();
        let recorder = span.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;

                match &result {
                    Ok(response) => {
                        recorder.record("messaging.outcome", response.outcome());
                        let status = if response.is_ack() { "OK" } else { "ERROR" };
                        recorder.record("otel.status_code", status);
                    }
                    Err(e) => {
                        recorder.record("otel.status_code", "ERROR");
                        tracing::error!(error = %e, "nats consume failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
