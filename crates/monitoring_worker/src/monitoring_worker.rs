use crate::domain::{
    alert_queue, AlertDispatcher, AlertRetryPolicy, DeviceDirectory, HistoryService,
    HourlyAggregator,
};
use crate::nats::{
    device_id_partition_key, DeviceEventConsumerService, HistoryRequestHandler, HistoryResponder,
    NatsNotificationProducer, ReadingConsumerService,
};
use anyhow::Context;
use common::domain::{
    DeviceRecord, DeviceRecordRepository, HourlyAggregateRepository, RawReadingRepository,
};
use common::nats::{
    DeadLetterPublisher, MessageRetryPolicy, NatsClient, NatsConsumeLoggingLayer,
    NatsConsumeTracingConfig, NatsConsumeTracingLayer, PartitionedConsumer,
    PartitionedConsumerConfig,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

pub type WorkerProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub struct MonitoringWorkerConfig {
    pub readings_stream: String,
    pub readings_subject_filter: String,
    pub readings_consumer_name: String,
    pub device_events_stream: String,
    pub device_events_subject_filter: String,
    pub device_events_consumer_name: String,
    pub dead_letter_stream: String,
    pub notification_subject_prefix: String,
    pub history_subject: String,
    pub history_queue_group: String,
    pub nats_batch_size: usize,
    pub nats_batch_wait_secs: u64,
    /// Reading partitions; device events always use a single worker
    pub worker_count: usize,
    pub processing_timeout: Duration,
    pub nak_delay: Duration,
    pub ack_wait: Duration,
    pub max_consecutive_failures: u32,
    pub retry_backoff: Duration,
    /// In-place retries of a transiently failing message before it is nak'd
    pub message_retry: MessageRetryPolicy,
    pub alert_queue_capacity: usize,
    pub alert_retry: AlertRetryPolicy,
}

impl MonitoringWorkerConfig {
    fn consumer_config(
        &self,
        stream_name: &str,
        consumer_name: &str,
        subject_filter: &str,
        worker_count: usize,
    ) -> PartitionedConsumerConfig {
        PartitionedConsumerConfig {
            stream_name: stream_name.to_string(),
            consumer_name: consumer_name.to_string(),
            subject_filter: subject_filter.to_string(),
            batch_size: self.nats_batch_size,
            max_wait: Duration::from_secs(self.nats_batch_wait_secs),
            worker_count,
            processing_timeout: self.processing_timeout,
            nak_delay: self.nak_delay,
            ack_wait: self.ack_wait,
            max_consecutive_failures: self.max_consecutive_failures,
            retry_backoff: self.retry_backoff,
            message_retry: self.message_retry,
        }
    }
}

/// Storage used by the worker; PostgreSQL in production, in-memory otherwise
pub struct MonitoringRepositories {
    pub devices: Arc<dyn DeviceRecordRepository>,
    pub readings: Arc<dyn RawReadingRepository>,
    pub aggregates: Arc<dyn HourlyAggregateRepository>,
}

pub struct MonitoringWorker {
    device_event_consumer: PartitionedConsumer,
    reading_consumer: PartitionedConsumer,
    alert_dispatcher: AlertDispatcher,
    history_responder: HistoryResponder,
}

impl MonitoringWorker {
    pub async fn new(
        repositories: MonitoringRepositories,
        seed_devices: Vec<DeviceRecord>,
        nats_client: Arc<NatsClient>,
        config: MonitoringWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!("Initializing monitoring worker");

        // Directory replica
        let directory = Arc::new(DeviceDirectory::new(repositories.devices));
        directory
            .hydrate()
            .await
            .context("failed to hydrate device directory")?;
        directory
            .seed(seed_devices)
            .await
            .context("failed to seed device directory")?;

        // Alerting
        let (alerter, alert_receiver) = alert_queue(config.alert_queue_capacity);
        let notification_producer = Arc::new(NatsNotificationProducer::new(
            nats_client.create_publisher_client(),
            config.notification_subject_prefix.clone(),
        ));
        let alert_dispatcher =
            AlertDispatcher::new(alert_receiver, notification_producer, config.alert_retry);

        // Device lifecycle consumer
        let device_event_service = ServiceBuilder::new()
            .layer(NatsConsumeTracingLayer::new(NatsConsumeTracingConfig::new(
                "device_event_consumer",
            )))
            .layer(NatsConsumeLoggingLayer::new())
            .service(DeviceEventConsumerService::new(Arc::clone(&directory)));
        let device_event_consumer = PartitionedConsumer::new(
            nats_client.create_consumer_client(),
            config.consumer_config(
                &config.device_events_stream,
                &config.device_events_consumer_name,
                &config.device_events_subject_filter,
                1,
            ),
            device_event_service,
            device_id_partition_key(),
            Some(DeadLetterPublisher::new(
                nats_client.create_publisher_client(),
                &config.dead_letter_stream,
                "device_events",
            )),
        )
        .await?;

        // Reading consumer
        let aggregator = Arc::new(HourlyAggregator::new(
            Arc::clone(&directory),
            repositories.readings,
            Arc::clone(&repositories.aggregates),
            Arc::new(alerter),
        ));
        let reading_service = ServiceBuilder::new()
            .layer(NatsConsumeTracingLayer::new(NatsConsumeTracingConfig::new(
                "reading_consumer",
            )))
            .layer(NatsConsumeLoggingLayer::new())
            .service(ReadingConsumerService::new(aggregator));
        let reading_consumer = PartitionedConsumer::new(
            nats_client.create_consumer_client(),
            config.consumer_config(
                &config.readings_stream,
                &config.readings_consumer_name,
                &config.readings_subject_filter,
                config.worker_count,
            ),
            reading_service,
            device_id_partition_key(),
            Some(DeadLetterPublisher::new(
                nats_client.create_publisher_client(),
                &config.dead_letter_stream,
                "readings",
            )),
        )
        .await?;

        // History query endpoint
        let history_responder = HistoryResponder::new(
            nats_client.client().clone(),
            config.history_subject.clone(),
            config.history_queue_group.clone(),
            HistoryRequestHandler::new(Arc::new(HistoryService::new(repositories.aggregates))),
        );

        info!(
            devices = directory.len(),
            workers = config.worker_count,
            "Monitoring worker initialized"
        );

        Ok(Self {
            device_event_consumer,
            reading_consumer,
            alert_dispatcher,
            history_responder,
        })
    }

    pub fn into_runner_processes(self) -> Vec<(&'static str, WorkerProcess)> {
        let Self {
            device_event_consumer,
            reading_consumer,
            alert_dispatcher,
            history_responder,
        } = self;

        vec![
            (
                "device_event_consumer",
                worker_process(move |ctx| device_event_consumer.run(ctx)),
            ),
            (
                "reading_consumer",
                worker_process(move |ctx| reading_consumer.run(ctx)),
            ),
            (
                "alert_dispatcher",
                worker_process(move |ctx| alert_dispatcher.run(ctx)),
            ),
            (
                "history_responder",
                worker_process(move |ctx| history_responder.run(ctx)),
            ),
        ]
    }
}

fn worker_process<F, Fut>(run: F) -> WorkerProcess
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(
        move |ctx: CancellationToken| -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(run(ctx))
        },
    )
}
