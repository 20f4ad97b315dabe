mod config;

use crate::config::{ServiceConfig, StorageBackend};
use common::memory::{
    InMemoryDeviceRecordRepository, InMemoryHourlyAggregateRepository,
    InMemoryRawReadingRepository,
};
use common::nats::{MessageRetryPolicy, NatsClient};
use common::postgres::{
    PostgresClient, PostgresDeviceRecordRepository, PostgresHourlyAggregateRepository,
    PostgresRawReadingRepository,
};
use common::telemetry::{
    init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig, TelemetryProviders,
};
use goose::MigrationRunner;
use meterline_runner::Runner;
use monitoring_worker::domain::AlertRetryPolicy;
use monitoring_worker::{MonitoringRepositories, MonitoringWorker, MonitoringWorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let log_format = match config.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("Invalid log format: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize telemetry (tracing + OpenTelemetry for traces and logs)
    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
        log_format,
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        storage_backend = ?config.storage_backend,
        "Starting meterline-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    let seed_devices = match config.seed_devices() {
        Ok(seeds) => seeds,
        Err(e) => {
            error!("Invalid seed devices: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize shared dependencies
    let (repositories, nats_client) = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize shared dependencies: {:#}", e);
            std::process::exit(1);
        }
    };

    let monitoring_worker = match MonitoringWorker::new(
        repositories,
        seed_devices,
        Arc::clone(&nats_client),
        worker_config(&config),
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize monitoring worker: {:#}", e);
            std::process::exit(1);
        }
    };

    // Build runner with all processes
    let mut runner = Runner::new();
    for (name, process) in monitoring_worker.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    // Add cleanup handlers
    runner = runner
        .with_closer({
            let nats_for_close = Arc::clone(&nats_client);
            move || async move {
                info!("Running cleanup tasks...");
                nats_for_close.close().await;

                // Shutdown telemetry and flush pending traces and logs
                shutdown_telemetry(telemetry_providers);

                info!("Cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    // Run the service
    runner.run().await;
}

fn worker_config(config: &ServiceConfig) -> MonitoringWorkerConfig {
    MonitoringWorkerConfig {
        readings_stream: config.readings_stream.clone(),
        readings_subject_filter: config.readings_subject_filter.clone(),
        readings_consumer_name: config.readings_consumer_name.clone(),
        device_events_stream: config.device_events_stream.clone(),
        device_events_subject_filter: config.device_events_subject_filter.clone(),
        device_events_consumer_name: config.device_events_consumer_name.clone(),
        dead_letter_stream: config.dead_letter_stream.clone(),
        notification_subject_prefix: config.notification_subject_prefix.clone(),
        history_subject: config.history_subject.clone(),
        history_queue_group: config.history_queue_group.clone(),
        nats_batch_size: config.nats_batch_size,
        nats_batch_wait_secs: config.nats_batch_wait_secs,
        worker_count: config.worker_count,
        processing_timeout: Duration::from_millis(config.processing_timeout_ms),
        nak_delay: Duration::from_millis(config.nak_delay_ms),
        ack_wait: Duration::from_secs(config.ack_wait_secs),
        max_consecutive_failures: config.max_consecutive_failures,
        retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        message_retry: MessageRetryPolicy {
            max_attempts: config.message_max_attempts,
            retry_delay: Duration::from_millis(config.message_retry_delay_ms),
        },
        alert_queue_capacity: config.alert_queue_capacity,
        alert_retry: AlertRetryPolicy {
            max_attempts: config.alert_max_attempts,
            retry_delay: Duration::from_millis(config.alert_retry_delay_ms),
        },
    }
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(MonitoringRepositories, Arc<NatsClient>)> {
    let repositories = match config.storage_backend {
        StorageBackend::Postgres => {
            info!("Initializing PostgreSQL...");
            run_postgres_migrations(config).await?;
            let client = PostgresClient::new(&config.postgres())?;
            client.ping().await?;
            MonitoringRepositories {
                devices: Arc::new(PostgresDeviceRecordRepository::new(client.clone())),
                readings: Arc::new(PostgresRawReadingRepository::new(client.clone())),
                aggregates: Arc::new(PostgresHourlyAggregateRepository::new(client)),
            }
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; readings and aggregates are lost on restart");
            MonitoringRepositories {
                devices: Arc::new(InMemoryDeviceRecordRepository::new()),
                readings: Arc::new(InMemoryRawReadingRepository::new()),
                aggregates: Arc::new(InMemoryHourlyAggregateRepository::new()),
            }
        }
    };

    // NATS initialization
    info!("Initializing NATS...");
    let nats_client = Arc::new(
        NatsClient::connect(
            &config.nats_url,
            Duration::from_secs(config.startup_timeout_secs),
        )
        .await?,
    );
    ensure_nats_streams(&nats_client, config).await?;

    Ok((repositories, nats_client))
}

async fn run_postgres_migrations(config: &ServiceConfig) -> anyhow::Result<()> {
    let postgres = config.postgres();
    let runner = MigrationRunner::new(
        postgres.goose_binary_path.clone(),
        postgres.migrations_dir.clone(),
        "postgres".to_string(),
        postgres.goose_dsn(),
    );
    runner.run_migrations().await
}

async fn ensure_nats_streams(client: &NatsClient, config: &ServiceConfig) -> anyhow::Result<()> {
    client
        .ensure_stream(&config.readings_stream, "Cumulative meter readings")
        .await?;
    client
        .ensure_stream(&config.device_events_stream, "Device registry lifecycle events")
        .await?;
    client
        .ensure_stream(
            &config.notification_subject_prefix,
            "Per-owner threshold notifications",
        )
        .await?;
    client
        .ensure_stream(&config.dead_letter_stream, "Unprocessable messages")
        .await?;
    Ok(())
}
