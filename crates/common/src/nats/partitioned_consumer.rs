use crate::nats::{
    ConsumeRequest, ConsumeResponse, DeadLetterPublisher, JetStreamConsumer, PullConsumer,
};
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, AckKind};
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

/// Extracts the ordering key (e.g. a device id) from a message.
///
/// Messages with the same key are always handled by the same worker, one at
/// a time, in fetch order. `None` routes the message to worker 0.
pub type PartitionKeyFn = Arc<dyn Fn(&ConsumeRequest) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PartitionedConsumerConfig {
    pub stream_name: String,
    pub consumer_name: String,
    pub subject_filter: String,
    pub batch_size: usize,
    pub max_wait: Duration,
    pub worker_count: usize,
    /// Upper bound for handling one message; exceeding it naks the message
    pub processing_timeout: Duration,
    /// How long JetStream waits before redelivering a nak'd message
    pub nak_delay: Duration,
    pub ack_wait: Duration,
    /// Consecutive failed batches tolerated before `run` gives up
    pub max_consecutive_failures: u32,
    pub retry_backoff: Duration,
    pub message_retry: MessageRetryPolicy,
}

/// In-place retries of a message whose handling failed transiently
/// (service error, timeout or nak), before it is nak'd back to JetStream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRetryPolicy {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for MessageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

struct PartitionJob {
    batch: u64,
    key: Option<String>,
    request: ConsumeRequest,
    reply: oneshot::Sender<ConsumeResponse>,
}

/// Fixed pool of workers, each owning a FIFO queue, selected by key hash.
///
/// Once a message is nak'd, the remaining messages of the same key in that
/// batch are nak'd without being handled, so redelivery cannot reorder a key.
pub struct PartitionDispatcher {
    workers: Vec<mpsc::Sender<PartitionJob>>,
    partition_key: PartitionKeyFn,
    next_batch: AtomicU64,
}

impl PartitionDispatcher {
    /// Spawn `worker_count` workers, each with its own clone of `service`.
    pub fn spawn<S>(
        service: S,
        worker_count: usize,
        queue_depth: usize,
        processing_timeout: Duration,
        retry: MessageRetryPolicy,
        partition_key: PartitionKeyFn,
    ) -> Self
    where
        S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let worker_count = worker_count.max(1);
        let workers = (0..worker_count)
            .map(|index| {
                let (tx, rx) = mpsc::channel(queue_depth.max(1));
                tokio::spawn(run_partition_worker(
                    index,
                    service.clone(),
                    rx,
                    processing_timeout,
                    retry,
                ));
                tx
            })
            .collect();

        Self {
            workers,
            partition_key,
            next_batch: AtomicU64::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn partition_for(&self, request: &ConsumeRequest) -> usize {
        self.partition_of((self.partition_key)(request).as_deref())
    }

    fn partition_of(&self, key: Option<&str>) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.workers.len() as u64) as usize
            }
            None => 0,
        }
    }

    /// Hand every request to its worker in order and collect the responses,
    /// positionally aligned with `requests`.
    pub async fn dispatch_batch(&self, requests: Vec<ConsumeRequest>) -> Vec<ConsumeResponse> {
        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let mut pending = Vec::with_capacity(requests.len());

        for request in requests {
            let key = (self.partition_key)(&request);
            let partition = self.partition_of(key.as_deref());
            let (reply, response) = oneshot::channel();
            let queued = self.workers[partition]
                .send(PartitionJob {
                    batch,
                    key,
                    request,
                    reply,
                })
                .await
                .is_ok();
            pending.push(queued.then_some(response));
        }

        let mut responses = Vec::with_capacity(pending.len());
        for response in pending {
            let resolved = match response {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| ConsumeResponse::nak("partition worker dropped message")),
                None => ConsumeResponse::nak("partition worker unavailable"),
            };
            responses.push(resolved);
        }
        responses
    }
}

async fn run_partition_worker<S>(
    index: usize,
    mut service: S,
    mut jobs: mpsc::Receiver<PartitionJob>,
    processing_timeout: Duration,
    retry: MessageRetryPolicy,
) where
    S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error> + Send,
    S::Future: Send,
{
    debug!(partition = index, "partition worker started");

    let mut current_batch = None;
    let mut rejected_keys: HashSet<String> = HashSet::new();

    while let Some(PartitionJob {
        batch,
        key,
        request,
        reply,
    }) = jobs.recv().await
    {
        if current_batch != Some(batch) {
            current_batch = Some(batch);
            rejected_keys.clear();
        }

        let response = match key.as_deref() {
            Some(key) if rejected_keys.contains(key) => {
                debug!(partition = index, subject = %request.subject, key, "holding back message behind rejected one");
                ConsumeResponse::nak(format!("earlier message for {key} was rejected"))
            }
            _ => handle_with_retries(index, &mut service, request, processing_timeout, retry).await,
        };

        if response.is_nak() {
            if let Some(key) = key {
                rejected_keys.insert(key);
            }
        }

        // The batch may have been abandoned on shutdown
        let _ = reply.send(response);
    }

    debug!(partition = index, "partition worker stopped");
}

async fn handle_with_retries<S>(
    index: usize,
    service: &mut S,
    request: ConsumeRequest,
    processing_timeout: Duration,
    retry: MessageRetryPolicy,
) -> ConsumeResponse
where
    S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error> + Send,
    S::Future: Send,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let response = handle_once(index, service, request.clone(), processing_timeout).await;
        if !response.is_nak() || attempt >= max_attempts {
            return response;
        }

        debug!(partition = index, subject = %request.subject, attempt, "retrying message in place");
        tokio::time::sleep(retry.retry_delay).await;
        attempt += 1;
    }
}

async fn handle_once<S>(
    index: usize,
    service: &mut S,
    request: ConsumeRequest,
    processing_timeout: Duration,
) -> ConsumeResponse
where
    S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error> + Send,
    S::Future: Send,
{
    let subject = request.subject.clone();
    let handled = tokio::time::timeout(processing_timeout, async {
        match service.ready().await {
            Ok(ready) => ready.call(request).await,
            Err(e) => Err(e),
        }
    })
    .await;

    match handled {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(partition = index, subject = %subject, error = %e, "service error processing message");
            ConsumeResponse::nak(e.to_string())
        }
        Err(_) => {
            warn!(
                partition = index,
                subject = %subject,
                timeout_ms = processing_timeout.as_millis(),
                "message processing timed out"
            );
            ConsumeResponse::nak("processing timed out")
        }
    }
}

/// Per-batch counts of message dispositions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub acked: usize,
    pub naked: usize,
    pub terminated: usize,
}

impl BatchSummary {
    /// Every message in a non-empty batch was nak'd
    pub fn is_stalled(&self) -> bool {
        self.naked > 0 && self.acked == 0 && self.terminated == 0
    }
}

/// JetStream pull consumer that fans each batch out to a `PartitionDispatcher`
/// and settles every message once its worker has answered.
pub struct PartitionedConsumer {
    consumer: Box<dyn PullConsumer>,
    config: PartitionedConsumerConfig,
    dispatcher: PartitionDispatcher,
    dead_letters: Option<DeadLetterPublisher>,
}

impl PartitionedConsumer {
    pub async fn new<S>(
        jetstream: Arc<dyn JetStreamConsumer>,
        config: PartitionedConsumerConfig,
        service: S,
        partition_key: PartitionKeyFn,
        dead_letters: Option<DeadLetterPublisher>,
    ) -> Result<Self>
    where
        S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        debug!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            filter_subject = %config.subject_filter,
            workers = config.worker_count,
            "creating partitioned nats consumer"
        );

        let pull_config = jetstream::consumer::pull::Config {
            name: Some(config.consumer_name.clone()),
            durable_name: Some(config.consumer_name.clone()),
            filter_subject: config.subject_filter.clone(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            ..Default::default()
        };

        let consumer = jetstream
            .create_consumer(pull_config, &config.stream_name)
            .await
            .context("failed to create consumer")?;

        let dispatcher = PartitionDispatcher::spawn(
            service,
            config.worker_count,
            config.batch_size,
            config.processing_timeout,
            config.message_retry,
            partition_key,
        );

        Ok(Self {
            consumer,
            config,
            dispatcher,
            dead_letters,
        })
    }

    /// Consume until cancelled. Returns an error once
    /// `max_consecutive_failures` batches in a row failed or stalled.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            workers = self.dispatcher.worker_count(),
            "starting partitioned nats consumer"
        );

        let mut consecutive_failures: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = ctx.cancelled() => {
                    info!(
                        stream = %self.config.stream_name,
                        consumer = %self.config.consumer_name,
                        "received shutdown signal, stopping consumer"
                    );
                    break;
                }
                result = self.fetch_and_process_batch() => result,
            };

            let failure = match result {
                Ok(summary) if !summary.is_stalled() => {
                    consecutive_failures = 0;
                    continue;
                }
                Ok(summary) => anyhow!("all {} messages in batch were rejected", summary.naked),
                Err(e) => e,
            };

            consecutive_failures += 1;
            error!(
                stream = %self.config.stream_name,
                consumer = %self.config.consumer_name,
                consecutive_failures,
                error = %failure,
                "error processing batch"
            );

            if consecutive_failures >= self.config.max_consecutive_failures {
                return Err(failure.context(format!(
                    "consumer {} exceeded {} consecutive failed batches",
                    self.config.consumer_name, self.config.max_consecutive_failures
                )));
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }

        debug!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            "consumer stopped gracefully"
        );
        Ok(())
    }

    async fn fetch_and_process_batch(&self) -> Result<BatchSummary> {
        let messages = self
            .consumer
            .fetch_messages(self.config.batch_size, self.config.max_wait)
            .await?;

        if messages.is_empty() {
            debug!("no messages in batch");
            return Ok(BatchSummary::default());
        }

        debug!(message_count = messages.len(), "received message batch");

        let requests = messages
            .iter()
            .map(|msg| {
                ConsumeRequest::new(
                    msg.subject.to_string(),
                    Bytes::copy_from_slice(&msg.payload),
                    msg.headers.clone(),
                )
            })
            .collect::<Vec<_>>();

        let responses = self.dispatcher.dispatch_batch(requests.clone()).await;

        let mut summary = BatchSummary::default();
        for ((msg, request), response) in messages.iter().zip(requests).zip(responses) {
            let disposition = self.settle(&request, response).await;
            let (kind, label) = match disposition {
                Disposition::Ack => {
                    summary.acked += 1;
                    (AckKind::Ack, "acknowledge")
                }
                Disposition::Nak => {
                    summary.naked += 1;
                    (AckKind::Nak(Some(self.config.nak_delay)), "reject")
                }
                Disposition::Term => {
                    summary.terminated += 1;
                    (AckKind::Term, "terminate")
                }
            };

            if let Err(e) = msg.ack_with(kind).await {
                error!(subject = %msg.subject, error = %e, "failed to {label} message");
            }
        }

        Ok(summary)
    }

    async fn settle(&self, request: &ConsumeRequest, response: ConsumeResponse) -> Disposition {
        match response {
            ConsumeResponse::Ack => Disposition::Ack,
            ConsumeResponse::Nak(reason) => {
                warn!(
                    subject = %request.subject,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "rejecting message"
                );
                Disposition::Nak
            }
            ConsumeResponse::Term(reason) => {
                let Some(dead_letters) = &self.dead_letters else {
                    warn!(subject = %request.subject, reason = %reason, "discarding unprocessable message");
                    return Disposition::Term;
                };
                match dead_letters.publish(request, &reason).await {
                    Ok(()) => Disposition::Term,
                    Err(e) => {
                        // Keep the message until it can be dead-lettered
                        error!(subject = %request.subject, error = %e, "dead-letter publish failed");
                        Disposition::Nak
                    }
                }
            }
        }
    }
}

enum Disposition {
    Ack,
    Nak,
    Term,
}
