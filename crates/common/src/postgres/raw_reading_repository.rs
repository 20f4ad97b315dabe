use crate::domain::{
    DomainError, DomainResult, RawReading, RawReadingRepository, ReadingWindowRepoInput,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::error::SqlState;
use tracing::{debug, instrument};

/// PostgreSQL implementation of RawReadingRepository
#[derive(Clone)]
pub struct PostgresRawReadingRepository {
    client: PostgresClient,
}

impl PostgresRawReadingRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RawReadingRepository for PostgresRawReadingRepository {
    #[instrument(skip(self, reading), fields(device_id = %reading.device_id, reading_at = %reading.timestamp))]
    async fn insert_reading(&self, reading: &RawReading) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let inserted = conn
            .execute(
                "INSERT INTO raw_readings (device_id, reading_at, cumulative_value)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (device_id, reading_at) DO NOTHING",
                &[
                    &reading.device_id,
                    &reading.timestamp,
                    &reading.cumulative_value,
                ],
            )
            .await
            .map_err(|e| match e.code() {
                Some(code) if *code == SqlState::DATETIME_FIELD_OVERFLOW => {
                    DomainError::InvalidReading(format!(
                        "timestamp {} cannot be stored",
                        reading.timestamp
                    ))
                }
                _ => DomainError::RepositoryError(e.into()),
            })?;

        if inserted == 0 {
            debug!("reading already stored");
        }
        Ok(inserted > 0)
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id, start = %input.start, end = %input.end))]
    async fn list_readings(&self, input: ReadingWindowRepoInput) -> DomainResult<Vec<RawReading>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT reading_at, cumulative_value
                 FROM raw_readings
                 WHERE device_id = $1 AND reading_at >= $2 AND reading_at < $3
                 ORDER BY reading_at ASC",
                &[&input.device_id, &input.start, &input.end],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows
            .iter()
            .map(|row| RawReading {
                device_id: input.device_id.clone(),
                timestamp: row.get("reading_at"),
                cumulative_value: row.get("cumulative_value"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn has_readings_before(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_one(
                "SELECT EXISTS(
                     SELECT 1 FROM raw_readings WHERE device_id = $1 AND reading_at < $2
                 ) AS found",
                &[&device_id, &before],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.get("found"))
    }
}
