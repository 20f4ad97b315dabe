use crate::domain::{DomainResult, RawReading, RawReadingRepository, ReadingWindowRepoInput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory append-only reading log keyed by (device_id, timestamp)
#[derive(Clone, Default)]
pub struct InMemoryRawReadingRepository {
    readings: Arc<RwLock<HashMap<String, BTreeMap<DateTime<Utc>, f64>>>>,
}

impl InMemoryRawReadingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count_for_device(&self, device_id: &str) -> usize {
        self.readings
            .read()
            .await
            .get(device_id)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RawReadingRepository for InMemoryRawReadingRepository {
    async fn insert_reading(&self, reading: &RawReading) -> DomainResult<bool> {
        let mut readings = self.readings.write().await;
        let device_log = readings.entry(reading.device_id.clone()).or_default();
        if device_log.contains_key(&reading.timestamp) {
            return Ok(false);
        }
        device_log.insert(reading.timestamp, reading.cumulative_value);
        Ok(true)
    }

    async fn list_readings(&self, input: ReadingWindowRepoInput) -> DomainResult<Vec<RawReading>> {
        if input.start >= input.end {
            return Ok(Vec::new());
        }
        let readings = self.readings.read().await;
        let Some(device_log) = readings.get(&input.device_id) else {
            return Ok(Vec::new());
        };

        Ok(device_log
            .range(input.start..input.end)
            .map(|(timestamp, value)| RawReading {
                device_id: input.device_id.clone(),
                timestamp: *timestamp,
                cumulative_value: *value,
            })
            .collect())
    }

    async fn has_readings_before(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let readings = self.readings.read().await;
        Ok(readings
            .get(device_id)
            .is_some_and(|log| log.range(..before).next().is_some()))
    }
}
