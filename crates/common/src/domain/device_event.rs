use crate::domain::device::{DevicePatch, DeviceRecord};
use crate::domain::result::{DomainError, DomainResult};
use std::fmt;
use std::str::FromStr;

/// Lifecycle event published by the device registry
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Created(DeviceRecord),
    Updated(DevicePatch),
    Deleted { device_id: String },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Created(record) => &record.device_id,
            DeviceEvent::Updated(patch) => &patch.device_id,
            DeviceEvent::Deleted { device_id } => device_id,
        }
    }

    pub fn kind(&self) -> DeviceEventKind {
        match self {
            DeviceEvent::Created(_) => DeviceEventKind::Create,
            DeviceEvent::Updated(_) => DeviceEventKind::Update,
            DeviceEvent::Deleted { .. } => DeviceEventKind::Delete,
        }
    }
}

/// Type tag carried alongside a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Create,
    Update,
    Delete,
}

impl DeviceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceEventKind::Create => "CREATE",
            DeviceEventKind::Update => "UPDATE",
            DeviceEventKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceEventKind {
    type Err = DomainError;

    /// Accepts the tag in any case ("CREATE", "create")
    fn from_str(s: &str) -> DomainResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(DeviceEventKind::Create),
            "UPDATE" => Ok(DeviceEventKind::Update),
            "DELETE" => Ok(DeviceEventKind::Delete),
            other => Err(DomainError::InvalidDeviceEvent(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}
