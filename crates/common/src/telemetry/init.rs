use anyhow::{Context, Result};
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, WithExportConfig};
use opentelemetry_sdk::{
    logs::{BatchLogProcessor, LoggerProvider},
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::Subscriber;
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

use super::{LogFormat, TelemetryConfig, TelemetryProviders, TraceContextLogProcessor};

/// Install the global tracing subscriber.
///
/// Stdout logging is always on. With `otel_enabled`, spans and log records
/// are also exported over OTLP/gRPC and W3C trace context propagation is
/// registered globally so NATS headers carry it between services.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Option<TelemetryProviders>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if !config.otel_enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer(config.log_format))
            .try_init()
            .context("failed to install tracing subscriber")?;
        return Ok(None);
    }

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new(vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        config.service_name.clone(),
    )]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otel_endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    let log_exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otel_endpoint)
        .build()
        .context("failed to build OTLP log exporter")?;

    let logger_provider = LoggerProvider::builder()
        .with_log_processor(TraceContextLogProcessor::new(
            BatchLogProcessor::builder(log_exporter, runtime::Tokio).build(),
        ))
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(config.service_name.clone());

    // Span layer before the log bridge so log records see the active OTel context
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(OpenTelemetryTracingBridge::new(&logger_provider))
        .with(stdout_layer(config.log_format))
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(Some(TelemetryProviders {
        tracer_provider,
        logger_provider,
    }))
}

fn stdout_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    }
}

/// Flush and stop the OTLP pipelines
pub fn shutdown_telemetry(providers: Option<TelemetryProviders>) {
    let Some(providers) = providers else {
        return;
    };
    if let Err(e) = providers.tracer_provider.shutdown() {
        eprintln!("Error shutting down tracer provider: {:?}", e);
    }
    if let Err(e) = providers.logger_provider.shutdown() {
        eprintln!("Error shutting down logger provider: {:?}", e);
    }
}
