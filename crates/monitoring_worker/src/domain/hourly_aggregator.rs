use crate::domain::{Alerter, DeviceDirectory};
use chrono::{DateTime, Utc};
use common::domain::{
    hour_bucket_start, previous_hour_bucket, AggregateAnomaly, DeviceRecord, DomainError,
    DomainResult, HourlyAggregate, HourlyAggregateRepository, Notification, RawReading,
    RawReadingRepository, ReadingWindowRepoInput,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How a single reading was handled
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The device is not in the directory; the reading was dropped
    UnknownDevice,
    /// First reading ever seen for the device
    Bootstrap,
    /// An earlier reading of the same hour already closed the previous hour
    DuplicateWithinHour,
    /// The previous hour has no readings, so it has no baseline
    GapInBaselineWindow { bucket: DateTime<Utc> },
    /// The previous hour was closed by an earlier delivery
    AlreadyAggregated { bucket: DateTime<Utc> },
    Aggregated {
        aggregate: HourlyAggregate,
        alerted: bool,
    },
}

/// Stores raw readings and closes out hourly consumption buckets.
///
/// Flow for a reading at `t` in bucket `H`:
/// 1. Resolve the device in the directory
/// 2. Inspect stored readings earlier than `t` (same bucket, and any at all)
/// 3. Store the reading
/// 4. The first reading of `H` closes `H - 1h`: delta against the earliest
///    reading of that hour, persisted once per (device, hour)
/// 5. Alert the owner when a fresh, trustworthy delta exceeds the threshold
pub struct HourlyAggregator {
    directory: Arc<DeviceDirectory>,
    readings: Arc<dyn RawReadingRepository>,
    aggregates: Arc<dyn HourlyAggregateRepository>,
    alerter: Arc<dyn Alerter>,
}

impl HourlyAggregator {
    pub fn new(
        directory: Arc<DeviceDirectory>,
        readings: Arc<dyn RawReadingRepository>,
        aggregates: Arc<dyn HourlyAggregateRepository>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            directory,
            readings,
            aggregates,
            alerter,
        }
    }

    #[instrument(skip(self, reading), fields(device_id = %reading.device_id, reading_at = %reading.timestamp))]
    pub async fn ingest(&self, reading: RawReading) -> DomainResult<IngestOutcome> {
        let bucket = hour_bucket_start(reading.timestamp);

        // 1. Resolve the device
        let Some(device) = self.directory.lookup(&reading.device_id) else {
            warn!("dropping reading from unknown device");
            return Ok(IngestOutcome::UnknownDevice);
        };

        // 2. History strictly before this reading, read before it is stored
        let prior_in_bucket = self
            .readings
            .list_readings(ReadingWindowRepoInput {
                device_id: reading.device_id.clone(),
                start: bucket,
                end: reading.timestamp,
            })
            .await?;
        let has_history = !prior_in_bucket.is_empty()
            || self
                .readings
                .has_readings_before(&reading.device_id, reading.timestamp)
                .await?;

        // 3. Store
        if !self.readings.insert_reading(&reading).await? {
            debug!("reading was already stored");
        }

        if !has_history {
            info!("first reading for device, nothing to aggregate yet");
            return Ok(IngestOutcome::Bootstrap);
        }
        if !prior_in_bucket.is_empty() {
            debug!(
                earlier_readings = prior_in_bucket.len(),
                "hour already opened by an earlier reading"
            );
            return Ok(IngestOutcome::DuplicateWithinHour);
        }

        // 4. Close the previous hour
        let previous = previous_hour_bucket(bucket);
        let baseline_window = self
            .readings
            .list_readings(ReadingWindowRepoInput {
                device_id: reading.device_id.clone(),
                start: previous,
                end: bucket,
            })
            .await?;
        let Some(baseline) = baseline_window.first() else {
            warn!(hour_bucket_start = %previous, "no readings in previous hour, skipping aggregation");
            return Ok(IngestOutcome::GapInBaselineWindow { bucket: previous });
        };

        let consumption_delta = reading.cumulative_value - baseline.cumulative_value;
        let anomaly = (consumption_delta < 0.0).then_some(AggregateAnomaly::CounterReset);
        let aggregate = HourlyAggregate {
            device_id: reading.device_id.clone(),
            hour_bucket_start: previous,
            consumption_delta,
            anomaly,
        };

        match self.aggregates.insert_aggregate(&aggregate).await {
            Ok(()) => {}
            Err(DomainError::AggregateAlreadyExists { .. }) => {
                debug!(hour_bucket_start = %previous, "hour already aggregated");
                return Ok(IngestOutcome::AlreadyAggregated { bucket: previous });
            }
            Err(e) => return Err(e),
        }

        if aggregate.is_anomalous() {
            warn!(
                hour_bucket_start = %previous,
                consumption_delta,
                baseline = baseline.cumulative_value,
                "counter went backwards, aggregate flagged as counter reset"
            );
        } else {
            info!(hour_bucket_start = %previous, consumption_delta, "hour aggregated");
        }

        // 5. Alert
        let alerted = !aggregate.is_anomalous()
            && consumption_delta > device.hourly_threshold
            && self.raise_alert(&device, &aggregate);

        Ok(IngestOutcome::Aggregated { aggregate, alerted })
    }

    fn raise_alert(&self, device: &DeviceRecord, aggregate: &HourlyAggregate) -> bool {
        let notification = Notification {
            owner_id: device.owner_id.clone(),
            device_id: aggregate.device_id.clone(),
            hour_bucket_start: aggregate.hour_bucket_start,
            consumption_delta: aggregate.consumption_delta,
        };

        match self.alerter.notify(notification) {
            Ok(()) => {
                info!(
                    owner_id = %device.owner_id,
                    threshold = device.hourly_threshold,
                    consumption_delta = aggregate.consumption_delta,
                    "hourly threshold exceeded, owner notified"
                );
                true
            }
            Err(e) => {
                // The aggregate stays; alerts are best effort
                warn!(error = %e, "failed to raise threshold alert");
                false
            }
        }
    }
}
