use crate::domain::result::DomainResult;
use async_trait::async_trait;
use garde::Validate;

/// Ownership and alerting threshold of a monitored device
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct DeviceRecord {
    #[garde(length(min = 1))]
    pub device_id: String,
    #[garde(length(min = 1))]
    pub owner_id: String,
    #[garde(custom(positive_threshold))]
    pub hourly_threshold: f64,
}

/// Partial update of a device record; absent fields are left unchanged
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct DevicePatch {
    #[garde(length(min = 1))]
    pub device_id: String,
    #[garde(length(min = 1))]
    pub owner_id: Option<String>,
    #[garde(custom(optional_positive_threshold))]
    pub hourly_threshold: Option<f64>,
}

impl DevicePatch {
    /// Apply the present fields on top of `record`
    pub fn apply_to(&self, record: &DeviceRecord) -> DeviceRecord {
        DeviceRecord {
            device_id: record.device_id.clone(),
            owner_id: self
                .owner_id
                .clone()
                .unwrap_or_else(|| record.owner_id.clone()),
            hourly_threshold: self.hourly_threshold.unwrap_or(record.hourly_threshold),
        }
    }
}

fn positive_threshold(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() && *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new("threshold must be a positive finite number"))
    }
}

fn optional_positive_threshold(value: &Option<f64>, ctx: &()) -> garde::Result {
    match value {
        Some(threshold) => positive_threshold(threshold, ctx),
        None => Ok(()),
    }
}

/// Durable copy of the device directory, used to hydrate the replica on boot
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRecordRepository: Send + Sync {
    /// Insert or replace the record for `record.device_id`
    async fn upsert_device(&self, record: &DeviceRecord) -> DomainResult<()>;

    /// Remove a record, returning whether it existed
    async fn delete_device(&self, device_id: &str) -> DomainResult<bool>;

    /// Every stored record
    async fn list_devices(&self) -> DomainResult<Vec<DeviceRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::garde::validate_struct;

    fn record() -> DeviceRecord {
        DeviceRecord {
            device_id: "meter-1".to_string(),
            owner_id: "owner-1".to_string(),
            hourly_threshold: 3.0,
        }
    }

    #[test]
    fn test_valid_record() {
        assert!(validate_struct(&record()).is_ok());
    }

    #[test]
    fn test_rejects_non_positive_threshold() {
        let mut invalid = record();
        invalid.hourly_threshold = 0.0;
        assert!(validate_struct(&invalid).is_err());

        invalid.hourly_threshold = f64::NAN;
        assert!(validate_struct(&invalid).is_err());
    }

    #[test]
    fn test_rejects_empty_owner() {
        let mut invalid = record();
        invalid.owner_id = String::new();
        assert!(validate_struct(&invalid).is_err());
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let patch = DevicePatch {
            device_id: "meter-1".to_string(),
            owner_id: None,
            hourly_threshold: Some(20.0),
        };

        let updated = patch.apply_to(&record());
        assert_eq!(updated.owner_id, "owner-1");
        assert_eq!(updated.hourly_threshold, 20.0);
    }

    #[test]
    fn test_patch_validation() {
        let patch = DevicePatch {
            device_id: "meter-1".to_string(),
            owner_id: Some(String::new()),
            hourly_threshold: None,
        };
        assert!(validate_struct(&patch).is_err());

        let patch = DevicePatch {
            device_id: "meter-1".to_string(),
            owner_id: None,
            hourly_threshold: Some(-1.0),
        };
        assert!(validate_struct(&patch).is_err());
    }
}
