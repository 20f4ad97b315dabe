use anyhow::Result;
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Creates durable pull consumers on a JetStream stream
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Fetch side of a pull consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `expires` for the batch to fill
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<jetstream::Message>>;
}

/// Publishes to JetStream and waits for the server acknowledgment
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<()>;
}
