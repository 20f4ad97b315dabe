use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher, PullConsumer};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .request_timeout(Some(timeout))
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("Successfully connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Create the stream `{stream_name}` capturing `{stream_name}.>` if it is missing
    pub async fn ensure_stream(&self, stream_name: &str, description: &str) -> Result<()> {
        info!(stream = %stream_name, "Ensuring stream exists");

        if self.jetstream.get_stream(stream_name).await.is_ok() {
            info!(stream = %stream_name, "Stream already exists");
            return Ok(());
        }

        let stream_config = StreamConfig {
            name: stream_name.to_string(),
            subjects: vec![format!("{}.>", stream_name)],
            description: Some(description.to_string()),
            ..Default::default()
        };

        self.jetstream
            .create_stream(stream_config)
            .await
            .with_context(|| format!("Failed to create stream {stream_name}"))?;
        info!(stream = %stream_name, "Created stream");

        Ok(())
    }

    /// Core NATS client, used for request/reply endpoints
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn create_consumer_client(&self) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(self.jetstream.clone()))
    }

    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    pub async fn close(&self) {
        info!("Flushing NATS connection");
        if let Err(e) = self.client.flush().await {
            error!(error = %e, "failed to flush NATS connection");
        }
    }
}

/// JetStreamConsumer backed by async-nats
pub struct NatsJetStreamConsumer {
    context: jetstream::Context,
}

impl NatsJetStreamConsumer {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self
            .context
            .create_consumer_on_stream(config, stream_name)
            .await
            .context("Failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer { consumer }))
    }
}

/// PullConsumer backed by async-nats
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::PullConsumer,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<jetstream::Message>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut result = Vec::with_capacity(max_messages);
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => result.push(message),
                Err(e) => {
                    // Unacked messages are redelivered after ack_wait
                    error!(error = %e, "Error receiving message");
                }
            }
        }
        Ok(result)
    }
}

/// JetStreamPublisher backed by async-nats
pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    #[instrument(skip(self, headers, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<()> {
        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .context("Failed to publish message to JetStream")?;

        ack.await
            .context("Failed to receive JetStream acknowledgment")?;
        Ok(())
    }
}
