use crate::domain::HistoryService;
use crate::nats::dto::{HistoryErrorMessage, HistoryRequestMessage, HistoryRowMessage};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use common::domain::DomainError;
use common::nats::set_parent_from_headers;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Turns a raw history request into a JSON reply body.
///
/// Replies are either the 24-row array or `{"error": "..."}`; a request never
/// goes unanswered.
#[derive(Clone)]
pub struct HistoryRequestHandler {
    service: Arc<HistoryService>,
}

impl HistoryRequestHandler {
    pub fn new(service: Arc<HistoryService>) -> Self {
        Self { service }
    }

    pub async fn handle(&self, payload: &[u8]) -> Bytes {
        match self.rows(payload).await {
            Ok(rows) => to_json(&rows),
            Err(e) => {
                warn!(error = %e, "history request failed");
                to_json(&HistoryErrorMessage {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn rows(&self, payload: &[u8]) -> Result<Vec<HistoryRowMessage>, DomainError> {
        let request: HistoryRequestMessage = serde_json::from_slice(payload)
            .map_err(|e| DomainError::InvalidHistoryRequest(format!("malformed request: {e}")))?;
        let date = request.parse_date()?;

        debug!(device_id = %request.device_id, date = %date, "answering history request");
        let rows = self.service.query(&request.device_id, date).await?;
        Ok(rows.into_iter().map(HistoryRowMessage::from).collect())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(body) => Bytes::from(body),
        Err(_) => Bytes::from_static(br#"{"error":"failed to encode response"}"#),
    }
}

/// Core NATS request/reply endpoint for history queries. Instances sharing a
/// queue group split the requests between them.
pub struct HistoryResponder {
    client: async_nats::Client,
    subject: String,
    queue_group: String,
    handler: HistoryRequestHandler,
}

impl HistoryResponder {
    pub fn new(
        client: async_nats::Client,
        subject: String,
        queue_group: String,
        handler: HistoryRequestHandler,
    ) -> Self {
        Self {
            client,
            subject,
            queue_group,
            handler,
        }
    }

    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        let mut subscription = self
            .client
            .queue_subscribe(self.subject.clone(), self.queue_group.clone())
            .await
            .with_context(|| format!("failed to subscribe to {}", self.subject))?;

        info!(subject = %self.subject, queue_group = %self.queue_group, "history responder listening");

        loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => break,
                next = subscription.next() => match next {
                    Some(message) => message,
                    None => bail!("history subscription on {} closed", self.subject),
                },
            };

            let Some(reply) = message.reply.clone() else {
                warn!(subject = %message.subject, "history request without reply subject ignored");
                continue;
            };

            let client = self.client.clone();
            let handler = self.handler.clone();
            let span = info_span!("history_request", reply = %reply);
            tokio::spawn(
                async move {
                    if let Some(headers) = message.headers.as_ref() {
                        set_parent_from_headers(headers);
                    }
                    let body = handler.handle(&message.payload).await;
                    if let Err(e) = client.publish(reply, body).await {
                        warn!(error = %e, "failed to publish history reply");
                    }
                }
                .instrument(span),
            );
        }

        if let Err(e) = subscription.unsubscribe().await {
            debug!(error = %e, "history unsubscribe failed during shutdown");
        }
        info!("history responder stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::domain::{HourlyAggregate, HourlyAggregateRepository};
    use common::memory::InMemoryHourlyAggregateRepository;

    async fn handler() -> HistoryRequestHandler {
        let repository = InMemoryHourlyAggregateRepository::new();
        repository
            .insert_aggregate(&HourlyAggregate {
                device_id: "meter-1".to_string(),
                hour_bucket_start: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
                consumption_delta: 4.0,
                anomaly: None,
            })
            .await
            .unwrap();
        HistoryRequestHandler::new(Arc::new(HistoryService::new(Arc::new(repository))))
    }

    #[tokio::test]
    async fn test_reply_has_24_rows() {
        let body = handler()
            .await
            .handle(br#"{"deviceId":"meter-1","date":"2024-03-01"}"#)
            .await;

        let rows: Vec<HistoryRowMessage> = serde_json::from_slice(&body).unwrap();
        assert_eq!(rows.len(), 24);
        assert_eq!(rows[10].consumption_delta, 4.0);
        assert_eq!(rows[9].consumption_delta, -1.0);
        assert_eq!(
            rows[0].hour_bucket_start,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_body() {
        let handler = handler().await;

        let body = handler.handle(b"not json").await;
        let error: HistoryErrorMessage = serde_json::from_slice(&body).unwrap();
        assert!(error.error.contains("malformed request"));

        let body = handler
            .handle(br#"{"deviceId":"meter-1","date":"yesterday"}"#)
            .await;
        let error: HistoryErrorMessage = serde_json::from_slice(&body).unwrap();
        assert!(error.error.contains("invalid date"));
    }
}
