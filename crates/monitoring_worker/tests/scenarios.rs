//! End-to-end aggregation scenarios against the in-memory stores.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use common::domain::{
    AggregateAnomaly, DeviceEvent, DeviceRecord, DomainError, DomainResult, HourlyAggregate,
    Notification, RawReading, RawReadingRepository, ReadingWindowRepoInput,
    MISSING_HOUR_SENTINEL,
};
use common::memory::{
    InMemoryDeviceRecordRepository, InMemoryHourlyAggregateRepository,
    InMemoryRawReadingRepository,
};
use common::nats::{ConsumeRequest, MessageRetryPolicy, PartitionDispatcher};
use monitoring_worker::domain::{
    alert_queue, DeviceDirectory, HistoryService, HourlyAggregator, IngestOutcome,
};
use monitoring_worker::nats::{
    device_id_partition_key, DeviceEventConsumerService, ReadingConsumerService,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

struct Harness {
    directory: Arc<DeviceDirectory>,
    readings: InMemoryRawReadingRepository,
    aggregates: InMemoryHourlyAggregateRepository,
    aggregator: Arc<HourlyAggregator>,
    notifications: mpsc::Receiver<Notification>,
}

/// Readings store whose window queries fail while `outages` is non-zero
#[derive(Clone)]
struct FlakyReadings {
    inner: InMemoryRawReadingRepository,
    outages: Arc<AtomicU32>,
}

#[async_trait]
impl RawReadingRepository for FlakyReadings {
    async fn insert_reading(&self, reading: &RawReading) -> DomainResult<bool> {
        self.inner.insert_reading(reading).await
    }

    async fn list_readings(&self, input: ReadingWindowRepoInput) -> DomainResult<Vec<RawReading>> {
        let remaining = self.outages.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outages.store(remaining - 1, Ordering::SeqCst);
            return Err(DomainError::RepositoryError(anyhow::anyhow!(
                "connection pool timed out"
            )));
        }
        self.inner.list_readings(input).await
    }

    async fn has_readings_before(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> DomainResult<bool> {
        self.inner.has_readings_before(device_id, before).await
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_outages(Arc::new(AtomicU32::new(0)))
    }

    fn with_outages(outages: Arc<AtomicU32>) -> Self {
        let directory = Arc::new(DeviceDirectory::new(Arc::new(
            InMemoryDeviceRecordRepository::new(),
        )));
        let readings = InMemoryRawReadingRepository::new();
        let aggregates = InMemoryHourlyAggregateRepository::new();
        let (alerter, notifications) = alert_queue(64);
        let aggregator = Arc::new(HourlyAggregator::new(
            Arc::clone(&directory),
            Arc::new(FlakyReadings {
                inner: readings.clone(),
                outages,
            }),
            Arc::new(aggregates.clone()),
            Arc::new(alerter),
        ));

        Self {
            directory,
            readings,
            aggregates,
            aggregator,
            notifications,
        }
    }

    async fn register(&self, device_id: &str, threshold: f64) {
        self.directory
            .apply(DeviceEvent::Created(DeviceRecord {
                device_id: device_id.to_string(),
                owner_id: format!("owner-of-{device_id}"),
                hourly_threshold: threshold,
            }))
            .await
            .unwrap();
    }

    async fn ingest(&self, device_id: &str, t: DateTime<Utc>, value: f64) -> IngestOutcome {
        self.aggregator
            .ingest(RawReading {
                device_id: device_id.to_string(),
                timestamp: t,
                cumulative_value: value,
            })
            .await
            .unwrap()
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut sent = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            sent.push(notification);
        }
        sent
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

fn reading_request(device_id: &str, t: DateTime<Utc>, value: f64) -> ConsumeRequest {
    let payload = format!(
        r#"{{"timestamp":{},"deviceId":"{}","value":{}}}"#,
        t.timestamp_millis(),
        device_id,
        value
    );
    ConsumeRequest::new("meter_readings.in".to_string(), Bytes::from(payload), None)
}

fn device_event_request(kind: &str, payload: &str) -> ConsumeRequest {
    ConsumeRequest::new(
        format!("device_events.{kind}"),
        Bytes::copy_from_slice(payload.as_bytes()),
        None,
    )
}

#[tokio::test]
async fn test_threshold_breach_produces_aggregate_and_notification() {
    let mut harness = Harness::new();
    harness.register("meter-a", 3.0).await;

    harness.ingest("meter-a", at(10, 5), 100.0).await;
    harness.ingest("meter-a", at(10, 50), 105.0).await;
    harness.ingest("meter-a", at(11, 2), 110.0).await;

    assert_eq!(
        harness.aggregates.all().await,
        vec![HourlyAggregate {
            device_id: "meter-a".to_string(),
            hour_bucket_start: at(10, 0),
            consumption_delta: 10.0,
            anomaly: None,
        }]
    );
    assert_eq!(
        harness.drain_notifications(),
        vec![Notification {
            owner_id: "owner-of-meter-a".to_string(),
            device_id: "meter-a".to_string(),
            hour_bucket_start: at(10, 0),
            consumption_delta: 10.0,
        }]
    );
}

#[tokio::test]
async fn test_gap_skips_hour_and_later_buckets_resume() {
    let harness = Harness::new();
    harness.register("meter-b", 100.0).await;

    assert_eq!(
        harness.ingest("meter-b", at(8, 30), 50.0).await,
        IngestOutcome::Bootstrap
    );
    assert_eq!(
        harness.ingest("meter-b", at(10, 2), 60.0).await,
        IngestOutcome::GapInBaselineWindow { bucket: at(9, 0) }
    );
    harness.ingest("meter-b", at(10, 40), 65.0).await;
    harness.ingest("meter-b", at(11, 5), 70.0).await;

    let aggregates = harness.aggregates.all().await;
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].hour_bucket_start, at(10, 0));
    assert_eq!(aggregates[0].consumption_delta, 10.0);
}

#[tokio::test]
async fn test_first_reading_never_aggregates() {
    let harness = Harness::new();
    harness.register("meter-c", 1.0).await;

    assert_eq!(
        harness.ingest("meter-c", at(10, 0), 5.0).await,
        IngestOutcome::Bootstrap
    );
    assert!(harness.aggregates.all().await.is_empty());
    assert_eq!(harness.readings.count_for_device("meter-c").await, 1);
}

#[tokio::test]
async fn test_raised_threshold_suppresses_notification() {
    let mut harness = Harness::new();
    let events = DeviceEventConsumerService::new(Arc::clone(&harness.directory));
    let readings = ReadingConsumerService::new(Arc::clone(&harness.aggregator));

    for request in [
        device_event_request(
            "create",
            r#"{"deviceId":"meter-d","ownerId":"owner-d","maxHourlyConsumption":5}"#,
        ),
        device_event_request("update", r#"{"deviceId":"meter-d","maxHourlyConsumption":20}"#),
    ] {
        assert!(events.clone().oneshot(request).await.unwrap().is_ack());
    }
    for request in [
        reading_request("meter-d", at(10, 5), 100.0),
        reading_request("meter-d", at(11, 5), 110.0),
    ] {
        assert!(readings.clone().oneshot(request).await.unwrap().is_ack());
    }

    let aggregates = harness.aggregates.all().await;
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].consumption_delta, 10.0);
    assert!(harness.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_daily_history_has_24_ascending_rows() {
    let harness = Harness::new();
    harness.register("meter-h", 1000.0).await;

    harness.ingest("meter-h", at(10, 0), 0.0).await;
    harness.ingest("meter-h", at(11, 0), 4.0).await;
    harness.ingest("meter-h", at(14, 10), 20.0).await;
    harness.ingest("meter-h", at(15, 0), 27.5).await;

    let history = HistoryService::new(Arc::new(harness.aggregates.clone()));
    let rows = history
        .query("meter-h", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        .await
        .unwrap();

    assert_eq!(rows.len(), 24);
    for (hour, row) in rows.iter().enumerate() {
        assert_eq!(row.hour_bucket_start, at(hour as u32, 0));
        match hour {
            10 => assert_eq!(row.consumption_delta, 4.0),
            14 => assert_eq!(row.consumption_delta, 7.5),
            _ => assert_eq!(row.consumption_delta, MISSING_HOUR_SENTINEL),
        }
    }
}

#[tokio::test]
async fn test_counter_reset_is_flagged_without_notification() {
    let mut harness = Harness::new();
    harness.register("meter-r", 1.0).await;

    harness.ingest("meter-r", at(10, 5), 99_990.0).await;
    harness.ingest("meter-r", at(11, 5), 12.0).await;

    let aggregates = harness.aggregates.all().await;
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].anomaly, Some(AggregateAnomaly::CounterReset));
    assert!(harness.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_concurrent_trigger_aggregates_once() {
    let mut harness = Harness::new();
    harness.register("meter-x", 3.0).await;
    harness.ingest("meter-x", at(10, 5), 100.0).await;

    let trigger = RawReading {
        device_id: "meter-x".to_string(),
        timestamp: at(11, 2),
        cumulative_value: 110.0,
    };
    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let aggregator = Arc::clone(&harness.aggregator);
            let reading = trigger.clone();
            tokio::spawn(async move { aggregator.ingest(reading).await.unwrap() })
        })
        .collect();

    let mut aggregated = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), IngestOutcome::Aggregated { .. }) {
            aggregated += 1;
        }
    }

    assert_eq!(aggregated, 1);
    assert_eq!(harness.aggregates.all().await.len(), 1);
    assert!(harness.drain_notifications().len() <= 1);
}

#[tokio::test]
async fn test_redelivery_yields_same_aggregates() {
    let sequence = [
        (at(9, 10), 10.0),
        (at(9, 40), 12.0),
        (at(10, 5), 15.0),
        (at(10, 55), 19.0),
        (at(11, 1), 30.0),
        (at(12, 0), 31.0),
    ];

    let mut once = Harness::new();
    once.register("meter-1", 5.0).await;
    for (t, value) in sequence {
        once.ingest("meter-1", t, value).await;
    }

    let mut redelivered = Harness::new();
    redelivered.register("meter-1", 5.0).await;
    for (t, value) in sequence {
        redelivered.ingest("meter-1", t, value).await;
        redelivered.ingest("meter-1", t, value).await;
    }
    for (t, value) in sequence {
        redelivered.ingest("meter-1", t, value).await;
    }

    assert_eq!(once.aggregates.all().await, redelivered.aggregates.all().await);
    assert_eq!(
        once.drain_notifications(),
        redelivered.drain_notifications()
    );
}

#[tokio::test]
async fn test_partitioned_dispatch_matches_sequential_ingestion() {
    let mut devices = Vec::new();
    for index in 0..6 {
        devices.push(format!("meter-{index}"));
    }

    let sequential = Harness::new();
    let partitioned = Harness::new();
    for device_id in &devices {
        sequential.register(device_id, 1000.0).await;
        partitioned.register(device_id, 1000.0).await;
    }

    let mut batch = Vec::new();
    for hour in 8..14 {
        for (index, device_id) in devices.iter().enumerate() {
            let value = f64::from(hour * 10) + index as f64;
            sequential.ingest(device_id, at(hour, 15), value).await;
            batch.push(reading_request(device_id, at(hour, 15), value));
        }
    }

    let dispatcher = PartitionDispatcher::spawn(
        ReadingConsumerService::new(Arc::clone(&partitioned.aggregator)),
        4,
        batch.len(),
        Duration::from_secs(5),
        MessageRetryPolicy::default(),
        device_id_partition_key(),
    );
    let responses = dispatcher.dispatch_batch(batch).await;

    assert!(responses.iter().all(|response| response.is_ack()));
    assert_eq!(
        sequential.aggregates.all().await,
        partitioned.aggregates.all().await
    );
    assert_eq!(partitioned.aggregates.all().await.len(), devices.len() * 5);
}

#[tokio::test]
async fn test_deleted_device_readings_are_dropped() {
    let harness = Harness::new();
    harness.register("meter-z", 5.0).await;
    harness.ingest("meter-z", at(10, 5), 100.0).await;

    harness
        .directory
        .apply(DeviceEvent::Deleted {
            device_id: "meter-z".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        harness.ingest("meter-z", at(11, 2), 110.0).await,
        IngestOutcome::UnknownDevice
    );
    assert_eq!(harness.readings.count_for_device("meter-z").await, 1);
    assert!(harness.aggregates.all().await.is_empty());
}

fn reading_dispatcher(harness: &Harness, max_attempts: u32) -> PartitionDispatcher {
    PartitionDispatcher::spawn(
        ReadingConsumerService::new(Arc::clone(&harness.aggregator)),
        2,
        16,
        Duration::from_secs(5),
        MessageRetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(1),
        },
        device_id_partition_key(),
    )
}

#[tokio::test]
async fn test_transient_store_failure_keeps_trigger_reading() {
    let outages = Arc::new(AtomicU32::new(0));
    let mut harness = Harness::with_outages(Arc::clone(&outages));
    harness.register("meter-f", 20.0).await;
    let dispatcher = reading_dispatcher(&harness, 3);

    let responses = dispatcher
        .dispatch_batch(vec![reading_request("meter-f", at(10, 5), 100.0)])
        .await;
    assert!(responses[0].is_ack());

    outages.store(1, Ordering::SeqCst);
    let responses = dispatcher
        .dispatch_batch(vec![
            reading_request("meter-f", at(11, 2), 110.0),
            reading_request("meter-f", at(11, 40), 150.0),
        ])
        .await;

    assert!(responses.iter().all(|response| response.is_ack()));
    let aggregates = harness.aggregates.all().await;
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].consumption_delta, 10.0);
    assert!(harness.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_rejected_trigger_holds_back_later_readings_until_redelivery() {
    let outages = Arc::new(AtomicU32::new(0));
    let mut harness = Harness::with_outages(Arc::clone(&outages));
    harness.register("meter-g", 20.0).await;
    let dispatcher = reading_dispatcher(&harness, 1);

    dispatcher
        .dispatch_batch(vec![reading_request("meter-g", at(10, 5), 100.0)])
        .await;

    outages.store(1, Ordering::SeqCst);
    let batch = vec![
        reading_request("meter-g", at(11, 2), 110.0),
        reading_request("meter-g", at(11, 40), 150.0),
    ];
    let responses = dispatcher.dispatch_batch(batch.clone()).await;
    assert!(responses.iter().all(|response| response.is_nak()));
    assert!(harness.aggregates.all().await.is_empty());

    // JetStream redelivers both, in stream order
    let responses = dispatcher.dispatch_batch(batch).await;
    assert!(responses.iter().all(|response| response.is_ack()));

    let aggregates = harness.aggregates.all().await;
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].consumption_delta, 10.0);
    assert!(harness.drain_notifications().is_empty());
}
