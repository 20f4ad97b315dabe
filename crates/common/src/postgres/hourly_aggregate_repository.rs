use crate::domain::{
    AggregateAnomaly, DomainError, DomainResult, HourlyAggregate, HourlyAggregateRepository,
    ListAggregatesRepoInput,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tracing::{debug, instrument, warn};

/// Row of the hourly_aggregates table
#[derive(Debug, Clone)]
pub struct HourlyAggregateRow {
    pub device_id: String,
    pub hour_bucket_start: DateTime<Utc>,
    pub consumption_delta: f64,
    pub anomaly: Option<String>,
}

impl From<&Row> for HourlyAggregateRow {
    fn from(row: &Row) -> Self {
        Self {
            device_id: row.get("device_id"),
            hour_bucket_start: row.get("hour_bucket_start"),
            consumption_delta: row.get("consumption_delta"),
            anomaly: row.get("anomaly"),
        }
    }
}

impl From<HourlyAggregateRow> for HourlyAggregate {
    fn from(row: HourlyAggregateRow) -> Self {
        let anomaly = row.anomaly.as_deref().and_then(|value| {
            let parsed = AggregateAnomaly::parse(value);
            if parsed.is_none() {
                warn!(anomaly = %value, "unrecognised aggregate anomaly");
            }
            parsed
        });

        HourlyAggregate {
            device_id: row.device_id,
            hour_bucket_start: row.hour_bucket_start,
            consumption_delta: row.consumption_delta,
            anomaly,
        }
    }
}

/// PostgreSQL implementation of HourlyAggregateRepository
#[derive(Clone)]
pub struct PostgresHourlyAggregateRepository {
    client: PostgresClient,
}

impl PostgresHourlyAggregateRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HourlyAggregateRepository for PostgresHourlyAggregateRepository {
    #[instrument(skip(self, aggregate), fields(device_id = %aggregate.device_id, hour_bucket_start = %aggregate.hour_bucket_start))]
    async fn insert_aggregate(&self, aggregate: &HourlyAggregate) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let anomaly = aggregate.anomaly.map(|a| a.as_str());
        let inserted = conn
            .execute(
                "INSERT INTO hourly_aggregates (device_id, hour_bucket_start, consumption_delta, anomaly)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (device_id, hour_bucket_start) DO NOTHING",
                &[
                    &aggregate.device_id,
                    &aggregate.hour_bucket_start,
                    &aggregate.consumption_delta,
                    &anomaly,
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if inserted == 0 {
            return Err(DomainError::AggregateAlreadyExists {
                device_id: aggregate.device_id.clone(),
                hour_bucket_start: aggregate.hour_bucket_start,
            });
        }

        debug!(
            consumption_delta = aggregate.consumption_delta,
            "stored hourly aggregate"
        );
        Ok(())
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id, start = %input.start, end = %input.end))]
    async fn list_aggregates(
        &self,
        input: ListAggregatesRepoInput,
    ) -> DomainResult<Vec<HourlyAggregate>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT device_id, hour_bucket_start, consumption_delta, anomaly
                 FROM hourly_aggregates
                 WHERE device_id = $1 AND hour_bucket_start >= $2 AND hour_bucket_start < $3
                 ORDER BY hour_bucket_start ASC",
                &[&input.device_id, &input.start, &input.end],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows
            .iter()
            .map(|row| HourlyAggregateRow::from(row).into())
            .collect())
    }
}
