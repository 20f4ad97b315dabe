use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Consumption of one device during one hour bucket
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyAggregate {
    pub device_id: String,
    pub hour_bucket_start: DateTime<Utc>,
    pub consumption_delta: f64,
    pub anomaly: Option<AggregateAnomaly>,
}

impl HourlyAggregate {
    pub fn is_anomalous(&self) -> bool {
        self.anomaly.is_some()
    }
}

/// Why an aggregate must not be trusted for alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateAnomaly {
    /// The cumulative counter went backwards (meter replaced or reset)
    CounterReset,
}

impl AggregateAnomaly {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateAnomaly::CounterReset => "counter_reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "counter_reset" => Some(AggregateAnomaly::CounterReset),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for listing aggregates of a device in `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAggregatesRepoInput {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Append-only aggregate store with at most one row per (device_id, hour_bucket_start)
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait HourlyAggregateRepository: Send + Sync {
    /// Insert an aggregate. Fails with `DomainError::AggregateAlreadyExists`
    /// when the (device, hour) pair is already taken.
    async fn insert_aggregate(&self, aggregate: &HourlyAggregate) -> DomainResult<()>;

    /// Aggregates in the window, ordered by hour ascending
    async fn list_aggregates(
        &self,
        input: ListAggregatesRepoInput,
    ) -> DomainResult<Vec<HourlyAggregate>>;
}
