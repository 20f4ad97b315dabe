use chrono::{DateTime, Utc};

/// Consumption reported for an hour with no stored aggregate
pub const MISSING_HOUR_SENTINEL: f64 = -1.0;

/// One row of a device's daily consumption history
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyHistoryRow {
    pub device_id: String,
    pub hour_bucket_start: DateTime<Utc>,
    pub consumption_delta: f64,
    pub anomalous: bool,
}

impl HourlyHistoryRow {
    pub fn missing(device_id: impl Into<String>, hour_bucket_start: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            hour_bucket_start,
            consumption_delta: MISSING_HOUR_SENTINEL,
            anomalous: false,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.consumption_delta == MISSING_HOUR_SENTINEL && !self.anomalous
    }
}
