use arc_swap::ArcSwap;
use common::domain::{
    DeviceEvent, DeviceRecord, DeviceRecordRepository, DomainResult,
};
use common::garde::validate_struct;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// What applying a lifecycle event did to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryChange {
    Created,
    Replaced,
    Updated,
    Deleted,
    /// The event matched the current state exactly
    Unchanged,
    /// Update or delete for a device the directory has never seen
    UnknownDevice,
}

/// Local replica of the device registry.
///
/// Lookups read an immutable snapshot and never wait on writers. Writes are
/// serialized, go to the repository first and only then replace the snapshot,
/// so a failed write leaves the replica untouched and the event is retried.
pub struct DeviceDirectory {
    snapshot: ArcSwap<HashMap<String, DeviceRecord>>,
    repository: Arc<dyn DeviceRecordRepository>,
    write_lock: Mutex<()>,
}

impl DeviceDirectory {
    pub fn new(repository: Arc<dyn DeviceRecordRepository>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            repository,
            write_lock: Mutex::new(()),
        }
    }

    /// Load every persisted record into the replica. Called once at startup.
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> DomainResult<usize> {
        let _guard = self.write_lock.lock().await;
        let records = self.repository.list_devices().await?;
        let devices: HashMap<String, DeviceRecord> = records
            .into_iter()
            .map(|record| (record.device_id.clone(), record))
            .collect();
        let count = devices.len();
        self.snapshot.store(Arc::new(devices));

        info!(devices = count, "device directory hydrated");
        Ok(count)
    }

    /// Insert each seed record whose device is not yet known; existing
    /// records are never overwritten. Returns how many were inserted.
    #[instrument(skip(self, seeds), fields(seeds = seeds.len()))]
    pub async fn seed(&self, seeds: Vec<DeviceRecord>) -> DomainResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut inserted = 0;

        for record in seeds {
            validate_struct(&record)?;
            if self.snapshot.load().contains_key(&record.device_id) {
                debug!(device_id = %record.device_id, "seed device already present");
                continue;
            }
            self.repository.upsert_device(&record).await?;
            self.store(|devices| {
                devices.insert(record.device_id.clone(), record);
            });
            inserted += 1;
        }

        if inserted > 0 {
            info!(inserted, "seeded device directory");
        }
        Ok(inserted)
    }

    /// Apply one lifecycle event. Events for the same device must be applied
    /// in the order they were published.
    #[instrument(skip(self, event), fields(device_id = %event.device_id(), event_type = %event.kind()))]
    pub async fn apply(&self, event: DeviceEvent) -> DomainResult<DirectoryChange> {
        let _guard = self.write_lock.lock().await;

        match event {
            DeviceEvent::Created(record) => {
                validate_struct(&record)?;
                let existing = self.lookup(&record.device_id);
                if existing.as_ref() == Some(&record) {
                    debug!("create matches current record");
                    return Ok(DirectoryChange::Unchanged);
                }

                self.repository.upsert_device(&record).await?;
                self.store(|devices| {
                    devices.insert(record.device_id.clone(), record);
                });

                if existing.is_some() {
                    info!("device record replaced by create");
                    Ok(DirectoryChange::Replaced)
                } else {
                    info!("device registered");
                    Ok(DirectoryChange::Created)
                }
            }
            DeviceEvent::Updated(patch) => {
                validate_struct(&patch)?;
                let Some(current) = self.lookup(&patch.device_id) else {
                    warn!("update for unknown device ignored");
                    return Ok(DirectoryChange::UnknownDevice);
                };

                let updated = patch.apply_to(&current);
                if updated == current {
                    debug!("update changes nothing");
                    return Ok(DirectoryChange::Unchanged);
                }

                self.repository.upsert_device(&updated).await?;
                self.store(|devices| {
                    devices.insert(updated.device_id.clone(), updated);
                });
                info!("device record updated");
                Ok(DirectoryChange::Updated)
            }
            DeviceEvent::Deleted { device_id } => {
                if !self.snapshot.load().contains_key(&device_id) {
                    debug!("delete for unknown device ignored");
                    return Ok(DirectoryChange::UnknownDevice);
                }

                self.repository.delete_device(&device_id).await?;
                self.store(|devices| {
                    devices.remove(&device_id);
                });
                info!("device removed");
                Ok(DirectoryChange::Deleted)
            }
        }
    }

    /// Current record for `device_id`, if any
    pub fn lookup(&self, device_id: &str) -> Option<DeviceRecord> {
        self.snapshot.load().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    // Callers hold `write_lock`
    fn store(&self, mutate: impl FnOnce(&mut HashMap<String, DeviceRecord>)) {
        let mut next = HashMap::clone(&self.snapshot.load());
        mutate(&mut next);
        self.snapshot.store(Arc::new(next));
    }
}
