use chrono::{NaiveDate, TimeDelta};
use common::domain::{
    day_hour_buckets, DomainError, DomainResult, HourlyAggregateRepository, HourlyHistoryRow,
    ListAggregatesRepoInput,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Answers "how much did this device consume each hour of this day"
pub struct HistoryService {
    aggregates: Arc<dyn HourlyAggregateRepository>,
}

impl HistoryService {
    pub fn new(aggregates: Arc<dyn HourlyAggregateRepository>) -> Self {
        Self { aggregates }
    }

    /// Exactly 24 rows for the UTC day, ascending. Hours without an aggregate
    /// carry the missing-hour sentinel.
    #[instrument(skip(self))]
    pub async fn query(&self, device_id: &str, date: NaiveDate) -> DomainResult<Vec<HourlyHistoryRow>> {
        if device_id.trim().is_empty() {
            return Err(DomainError::InvalidHistoryRequest(
                "deviceId must not be empty".to_string(),
            ));
        }

        let hours = day_hour_buckets(date);
        let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        let stored: HashMap<_, _> = self
            .aggregates
            .list_aggregates(ListAggregatesRepoInput {
                device_id: device_id.to_string(),
                start,
                end: start + TimeDelta::days(1),
            })
            .await?
            .into_iter()
            .map(|aggregate| (aggregate.hour_bucket_start, aggregate))
            .collect();

        debug!(aggregated_hours = stored.len(), "loaded daily aggregates");

        Ok(hours
            .into_iter()
            .map(|hour| match stored.get(&hour) {
                Some(aggregate) => HourlyHistoryRow {
                    device_id: device_id.to_string(),
                    hour_bucket_start: hour,
                    consumption_delta: aggregate.consumption_delta,
                    anomalous: aggregate.is_anomalous(),
                },
                None => HourlyHistoryRow::missing(device_id, hour),
            })
            .collect())
    }
}
