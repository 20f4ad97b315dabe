use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::types::{PublishRequest, PublishResponse};
use crate::nats::trace_context::inject_trace_context;
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument, Span};

/// Configuration for publish tracing middleware
#[derive(Clone, Debug, Default)]
pub struct NatsPublishTracingConfig {
    /// Logical name of the producer, recorded on every span
    pub publisher_name: String,
}

impl NatsPublishTracingConfig {
    pub fn new(publisher_name: impl Into<String>) -> Self {
        Self {
            publisher_name: publisher_name.into(),
        }
    }
}

/// Tower layer opening a `nats_publish` span and propagating its context
#[derive(Clone)]
pub struct NatsPublishTracingLayer {
    config: NatsPublishTracingConfig,
}

impl NatsPublishTracingLayer {
    pub fn new(config: NatsPublishTracingConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for NatsPublishTracingLayer {
    type Service = NatsPublishTracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsPublishTracingService {
            inner: service,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct NatsPublishTracingService<S> {
    inner: S,
    config: NatsPublishTracingConfig,
}

impl<S> Service<PublishRequest> for NatsPublishTracingService<S>
where
    S: Service<PublishRequest, Response = PublishResponse> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: PublishRequest) -> Self::Future {
        let span = info_span!(
            target: "nats",
            "nats_publish",
            otel.name = %format!("{} publish", req.subject),
            messaging.system = "nats",
            messaging.operation = "publish",
            messaging.destination.name = %req.subject,
            messaging.message.body.size = req.payload.len(),
            messaging.producer.name = %self.config.publisher_name,
            otel.status_code = field::Empty,
        );

        // Inject inside the publish span so consumers parent to it
        span.in_scope(|| inject_trace_context(&mut req.headers));

        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let status = if result.is_ok() { "OK" } else { "ERROR" };
                Span::current().record("otel.status_code", status);
                result
            }
            .instrument(span),
        )
    }
}
