use crate::domain::DeviceDirectory;
use crate::nats::dto::parse_device_event;
use common::nats::{ConsumeRequest, ConsumeResponse};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, error, warn};

/// Tower service applying device lifecycle events to the directory replica
#[derive(Clone)]
pub struct DeviceEventConsumerService {
    directory: Arc<DeviceDirectory>,
}

impl DeviceEventConsumerService {
    pub fn new(directory: Arc<DeviceDirectory>) -> Self {
        Self { directory }
    }
}

impl Service<ConsumeRequest> for DeviceEventConsumerService {
    type Response = ConsumeResponse;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<ConsumeResponse, anyhow::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let directory = Arc::clone(&self.directory);

        Box::pin(async move {
            let event = match parse_device_event(&req) {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, subject = %req.subject, "failed to decode device event");
                    return Ok(ConsumeResponse::term(e.to_string()));
                }
            };
            let device_id = event.device_id().to_string();
            let kind = event.kind();

            match directory.apply(event).await {
                Ok(change) => {
                    debug!(device_id = %device_id, event_type = %kind, change = ?change, "device event applied");
                    Ok(ConsumeResponse::ack())
                }
                Err(e) if e.is_permanent() => {
                    error!(error = %e, device_id = %device_id, event_type = %kind, "rejecting device event");
                    Ok(ConsumeResponse::term(e.to_string()))
                }
                Err(e) => {
                    warn!(error = %e, device_id = %device_id, event_type = %kind, "failed to apply device event");
                    Ok(ConsumeResponse::nak(e.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::dto::EVENT_TYPE_HEADER;
    use async_nats::HeaderMap;
    use bytes::Bytes;
    use common::domain::{DomainError, MockDeviceRecordRepository};
    use common::memory::InMemoryDeviceRecordRepository;
    use tower::ServiceExt;

    fn request(subject: &str, payload: &str) -> ConsumeRequest {
        ConsumeRequest::new(
            subject.to_string(),
            Bytes::copy_from_slice(payload.as_bytes()),
            None,
        )
    }

    #[tokio::test]
    async fn test_lifecycle_events_update_directory() {
        let directory = Arc::new(DeviceDirectory::new(Arc::new(
            InMemoryDeviceRecordRepository::new(),
        )));
        let service = DeviceEventConsumerService::new(Arc::clone(&directory));

        let created = service
            .clone()
            .oneshot(request(
                "device_events.create",
                r#"{"deviceId":"meter-1","ownerId":"owner-1","maxHourlyConsumption":5}"#,
            ))
            .await
            .unwrap();
        assert!(created.is_ack());
        assert_eq!(directory.lookup("meter-1").unwrap().hourly_threshold, 5.0);

        let mut headers = HeaderMap::new();
        headers.insert(EVENT_TYPE_HEADER, "UPDATE");
        let updated = service
            .clone()
            .oneshot(ConsumeRequest::new(
                "device_events".to_string(),
                Bytes::from_static(br#"{"deviceId":"meter-1","maxHourlyConsumption":20}"#),
                Some(headers),
            ))
            .await
            .unwrap();
        assert!(updated.is_ack());
        assert_eq!(directory.lookup("meter-1").unwrap().hourly_threshold, 20.0);

        let deleted = service
            .oneshot(request("device_events.delete", r#"{"deviceId":"meter-1"}"#))
            .await
            .unwrap();
        assert!(deleted.is_ack());
        assert!(directory.lookup("meter-1").is_none());
    }

    #[tokio::test]
    async fn test_invalid_events_are_terminated() {
        let directory = Arc::new(DeviceDirectory::new(Arc::new(
            InMemoryDeviceRecordRepository::new(),
        )));
        let service = DeviceEventConsumerService::new(directory);

        let negative = service
            .clone()
            .oneshot(request(
                "device_events.create",
                r#"{"deviceId":"meter-1","ownerId":"owner-1","maxHourlyConsumption":-5}"#,
            ))
            .await
            .unwrap();
        assert!(negative.is_term());

        let garbage = service
            .oneshot(request("device_events.create", "{"))
            .await
            .unwrap();
        assert!(garbage.is_term());
    }

    #[tokio::test]
    async fn test_repository_failure_is_naked() {
        let mut repository = MockDeviceRecordRepository::new();
        repository
            .expect_upsert_device()
            .times(1)
            .returning(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("pool exhausted"))));
        let service =
            DeviceEventConsumerService::new(Arc::new(DeviceDirectory::new(Arc::new(repository))));

        let response = service
            .oneshot(request(
                "device_events.create",
                r#"{"deviceId":"meter-1","ownerId":"owner-1","maxHourlyConsumption":5}"#,
            ))
            .await
            .unwrap();

        assert!(response.is_nak());
    }
}
