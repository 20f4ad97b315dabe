use crate::domain::{DeviceRecord, DeviceRecordRepository, DomainResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory implementation of DeviceRecordRepository
#[derive(Clone, Default)]
pub struct InMemoryDeviceRecordRepository {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl InMemoryDeviceRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceRecordRepository for InMemoryDeviceRecordRepository {
    async fn upsert_device(&self, record: &DeviceRecord) -> DomainResult<()> {
        let mut devices = self.devices.write().await;
        devices.insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> DomainResult<bool> {
        let mut devices = self.devices.write().await;
        Ok(devices.remove(device_id).is_some())
    }

    async fn list_devices(&self) -> DomainResult<Vec<DeviceRecord>> {
        let devices = self.devices.read().await;
        let mut records: Vec<DeviceRecord> = devices.values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(records)
    }
}
