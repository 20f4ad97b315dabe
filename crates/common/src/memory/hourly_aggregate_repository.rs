use crate::domain::{
    DomainError, DomainResult, HourlyAggregate, HourlyAggregateRepository,
    ListAggregatesRepoInput,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type AggregateKey = (String, DateTime<Utc>);

/// In-memory aggregate store enforcing one row per (device_id, hour_bucket_start)
#[derive(Clone, Default)]
pub struct InMemoryHourlyAggregateRepository {
    aggregates: Arc<RwLock<BTreeMap<AggregateKey, HourlyAggregate>>>,
}

impl InMemoryHourlyAggregateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<HourlyAggregate> {
        self.aggregates.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl HourlyAggregateRepository for InMemoryHourlyAggregateRepository {
    async fn insert_aggregate(&self, aggregate: &HourlyAggregate) -> DomainResult<()> {
        let key = (aggregate.device_id.clone(), aggregate.hour_bucket_start);
        let mut aggregates = self.aggregates.write().await;
        if aggregates.contains_key(&key) {
            return Err(DomainError::AggregateAlreadyExists {
                device_id: aggregate.device_id.clone(),
                hour_bucket_start: aggregate.hour_bucket_start,
            });
        }
        aggregates.insert(key, aggregate.clone());
        Ok(())
    }

    async fn list_aggregates(
        &self,
        input: ListAggregatesRepoInput,
    ) -> DomainResult<Vec<HourlyAggregate>> {
        if input.start >= input.end {
            return Ok(Vec::new());
        }
        let aggregates = self.aggregates.read().await;
        let start = (input.device_id.clone(), input.start);
        let end = (input.device_id, input.end);
        Ok(aggregates
            .range(start..end)
            .map(|(_, aggregate)| aggregate.clone())
            .collect())
    }
}
