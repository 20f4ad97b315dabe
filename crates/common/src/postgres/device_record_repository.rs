use crate::domain::{DeviceRecord, DeviceRecordRepository, DomainError, DomainResult};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::Utc;
use tokio_postgres::Row;
use tracing::{debug, instrument};

/// Row of the monitored_devices table
#[derive(Debug, Clone)]
pub struct MonitoredDeviceRow {
    pub device_id: String,
    pub owner_id: String,
    pub hourly_threshold: f64,
}

impl From<&Row> for MonitoredDeviceRow {
    fn from(row: &Row) -> Self {
        Self {
            device_id: row.get("device_id"),
            owner_id: row.get("owner_id"),
            hourly_threshold: row.get("hourly_threshold"),
        }
    }
}

impl From<MonitoredDeviceRow> for DeviceRecord {
    fn from(row: MonitoredDeviceRow) -> Self {
        DeviceRecord {
            device_id: row.device_id,
            owner_id: row.owner_id,
            hourly_threshold: row.hourly_threshold,
        }
    }
}

/// PostgreSQL implementation of DeviceRecordRepository
#[derive(Clone)]
pub struct PostgresDeviceRecordRepository {
    client: PostgresClient,
}

impl PostgresDeviceRecordRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRecordRepository for PostgresDeviceRecordRepository {
    #[instrument(skip(self, record), fields(device_id = %record.device_id))]
    async fn upsert_device(&self, record: &DeviceRecord) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let now = Utc::now();
        conn.execute(
            "INSERT INTO monitored_devices (device_id, owner_id, hourly_threshold, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (device_id) DO UPDATE
             SET owner_id = EXCLUDED.owner_id,
                 hourly_threshold = EXCLUDED.hourly_threshold,
                 updated_at = EXCLUDED.updated_at",
            &[
                &record.device_id,
                &record.owner_id,
                &record.hourly_threshold,
                &now,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!(device_id = %record.device_id, "upserted monitored device");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_device(&self, device_id: &str) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .execute(
                "DELETE FROM monitored_devices WHERE device_id = $1",
                &[&device_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows > 0)
    }

    #[instrument(skip(self))]
    async fn list_devices(&self) -> DomainResult<Vec<DeviceRecord>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT device_id, owner_id, hourly_threshold
                 FROM monitored_devices
                 ORDER BY device_id",
                &[],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows
            .iter()
            .map(|row| MonitoredDeviceRow::from(row).into())
            .collect())
    }
}
