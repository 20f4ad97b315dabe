//! JSON wire formats exchanged over NATS and their domain conversions.

use chrono::{DateTime, NaiveDate, Utc};
use common::domain::{
    DeviceEvent, DeviceEventKind, DevicePatch, DeviceRecord, DomainError, DomainResult,
    HourlyHistoryRow, Notification, RawReading,
};
use common::nats::{ConsumeRequest, PartitionKeyFn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header carrying the lifecycle event type tag
pub const EVENT_TYPE_HEADER: &str = "Event-Type";
/// Header identifying the recipient of a notification
pub const OWNER_ID_HEADER: &str = "Owner-Id";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingMessage {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub device_id: String,
    pub value: f64,
}

impl ReadingMessage {
    pub fn into_domain(self) -> DomainResult<RawReading> {
        RawReading::from_epoch_millis(self.device_id, self.timestamp, self.value)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventMessage {
    pub device_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub max_hourly_consumption: Option<f64>,
}

impl DeviceEventMessage {
    pub fn into_event(self, kind: DeviceEventKind) -> DomainResult<DeviceEvent> {
        match kind {
            DeviceEventKind::Create => {
                let owner_id = self.owner_id.ok_or_else(|| {
                    DomainError::InvalidDeviceEvent(format!(
                        "CREATE for {} without ownerId",
                        self.device_id
                    ))
                })?;
                let hourly_threshold = self.max_hourly_consumption.ok_or_else(|| {
                    DomainError::InvalidDeviceEvent(format!(
                        "CREATE for {} without maxHourlyConsumption",
                        self.device_id
                    ))
                })?;
                Ok(DeviceEvent::Created(DeviceRecord {
                    device_id: self.device_id,
                    owner_id,
                    hourly_threshold,
                }))
            }
            DeviceEventKind::Update => Ok(DeviceEvent::Updated(DevicePatch {
                device_id: self.device_id,
                owner_id: self.owner_id,
                hourly_threshold: self.max_hourly_consumption,
            })),
            DeviceEventKind::Delete => Ok(DeviceEvent::Deleted {
                device_id: self.device_id,
            }),
        }
    }
}

/// Event type from the `Event-Type` header, else from the subject suffix
/// (`device_events.update` -> UPDATE)
pub fn device_event_kind(request: &ConsumeRequest) -> DomainResult<DeviceEventKind> {
    if let Some(tag) = request.header(EVENT_TYPE_HEADER) {
        return tag.parse();
    }
    match request.subject.rsplit_once('.') {
        Some((_, suffix)) => suffix.parse(),
        None => Err(DomainError::InvalidDeviceEvent(format!(
            "no event type on subject {}",
            request.subject
        ))),
    }
}

pub fn parse_device_event(request: &ConsumeRequest) -> DomainResult<DeviceEvent> {
    let kind = device_event_kind(request)?;
    let message: DeviceEventMessage = serde_json::from_slice(&request.payload)
        .map_err(|e| DomainError::InvalidDeviceEvent(format!("malformed {kind} payload: {e}")))?;
    message.into_event(kind)
}

#[derive(Deserialize)]
struct DeviceIdOnly {
    #[serde(rename = "deviceId")]
    device_id: String,
}

/// Partition messages by their `deviceId` field. Undecodable payloads fall
/// back to partition 0 and are rejected by the service.
pub fn device_id_partition_key() -> PartitionKeyFn {
    Arc::new(|request: &ConsumeRequest| {
        serde_json::from_slice::<DeviceIdOnly>(&request.payload)
            .ok()
            .map(|message| message.device_id)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub device_id: String,
    pub hour_bucket_start: DateTime<Utc>,
    pub consumption_delta: f64,
}

impl From<&Notification> for NotificationMessage {
    fn from(notification: &Notification) -> Self {
        Self {
            device_id: notification.device_id.clone(),
            hour_bucket_start: notification.hour_bucket_start,
            consumption_delta: notification.consumption_delta,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequestMessage {
    pub device_id: String,
    pub date: String,
}

impl HistoryRequestMessage {
    /// Accepts a calendar date (`2024-03-01`) or an RFC 3339 timestamp, whose
    /// UTC date is used
    pub fn parse_date(&self) -> DomainResult<NaiveDate> {
        let raw = self.date.trim();
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc).date_naive()))
            .map_err(|_| DomainError::InvalidHistoryRequest(format!("invalid date: {raw}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRowMessage {
    pub device_id: String,
    pub hour_bucket_start: DateTime<Utc>,
    pub consumption_delta: f64,
    pub anomalous: bool,
}

impl From<HourlyHistoryRow> for HistoryRowMessage {
    fn from(row: HourlyHistoryRow) -> Self {
        Self {
            device_id: row.device_id,
            hour_bucket_start: row.hour_bucket_start,
            consumption_delta: row.consumption_delta,
            anomalous: row.anomalous,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryErrorMessage {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_nats::HeaderMap;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn request(subject: &str, payload: &str, event_type: Option<&str>) -> ConsumeRequest {
        let headers = event_type.map(|tag| {
            let mut headers = HeaderMap::new();
            headers.insert(EVENT_TYPE_HEADER, tag);
            headers
        });
        ConsumeRequest::new(
            subject.to_string(),
            Bytes::copy_from_slice(payload.as_bytes()),
            headers,
        )
    }

    #[test]
    fn test_reading_wire_format() {
        let message: ReadingMessage =
            serde_json::from_str(r#"{"timestamp":1709287500000,"deviceId":"meter-1","value":100.5}"#)
                .unwrap();
        let reading = message.into_domain().unwrap();

        assert_eq!(reading.device_id, "meter-1");
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_event_type_header_wins_over_subject() {
        let req = request(
            "device_events.delete",
            r#"{"deviceId":"meter-1","ownerId":"owner-1","maxHourlyConsumption":5.0}"#,
            Some("CREATE"),
        );

        assert_eq!(device_event_kind(&req).unwrap(), DeviceEventKind::Create);
        assert!(matches!(
            parse_device_event(&req).unwrap(),
            DeviceEvent::Created(record) if record.hourly_threshold == 5.0
        ));
    }

    #[test]
    fn test_event_type_from_subject_suffix() {
        let req = request(
            "device_events.update",
            r#"{"deviceId":"meter-1","maxHourlyConsumption":20}"#,
            None,
        );

        match parse_device_event(&req).unwrap() {
            DeviceEvent::Updated(patch) => {
                assert_eq!(patch.owner_id, None);
                assert_eq!(patch.hourly_threshold, Some(20.0));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_create_requires_owner_and_threshold() {
        let req = request("device_events.create", r#"{"deviceId":"meter-1"}"#, None);
        let err = parse_device_event(&req).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let req = request("device_events", r#"{"deviceId":"meter-1"}"#, None);
        assert!(parse_device_event(&req).unwrap_err().is_permanent());

        let req = request("device_events.rename", r#"{"deviceId":"meter-1"}"#, None);
        assert!(parse_device_event(&req).unwrap_err().is_permanent());
    }

    #[test]
    fn test_partition_key_reads_device_id() {
        let key = device_id_partition_key();

        let req = request("meter_readings.in", r#"{"timestamp":1,"deviceId":"meter-7","value":1}"#, None);
        assert_eq!(key(&req), Some("meter-7".to_string()));

        let garbage = request("meter_readings.in", "not json", None);
        assert_eq!(key(&garbage), None);
    }

    #[test]
    fn test_notification_serializes_iso_timestamp() {
        let message = NotificationMessage {
            device_id: "meter-1".to_string(),
            hour_bucket_start: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            consumption_delta: 10.0,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["deviceId"], "meter-1");
        assert_eq!(json["hourBucketStart"], "2024-03-01T10:00:00Z");
        assert_eq!(json["consumptionDelta"], 10.0);
    }

    #[test]
    fn test_history_date_formats() {
        let mut request = HistoryRequestMessage {
            device_id: "meter-1".to_string(),
            date: "2024-03-01".to_string(),
        };
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(request.parse_date().unwrap(), expected);

        request.date = "2024-03-01T23:30:00Z".to_string();
        assert_eq!(request.parse_date().unwrap(), expected);

        request.date = "01/03/2024".to_string();
        assert!(request.parse_date().unwrap_err().is_permanent());
    }
}
