use async_nats::HeaderMap;
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// W3C Trace Context header names
const TRACEPARENT: &str = "traceparent";
const TRACESTATE: &str = "tracestate";

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value.as_str());
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        [TRACEPARENT, TRACESTATE]
            .into_iter()
            .filter(|key| self.0.get(*key).is_some())
            .collect()
    }
}

/// Write the current span's trace context into outgoing message headers.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    global::get_text_map_propagator(|propagator| {
        let ctx = tracing::Span::current().context();
        propagator.inject_context(&ctx, &mut HeaderInjector(headers));
    });
}

/// Read a propagated trace context from incoming message headers.
pub fn extract_trace_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Attach the current span to the publisher's trace, if the headers carry one.
pub fn set_parent_from_headers(headers: &HeaderMap) {
    tracing::Span::current().set_parent(extract_trace_context(headers));
}
