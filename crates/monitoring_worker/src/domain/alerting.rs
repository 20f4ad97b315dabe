use common::domain::{DomainError, DomainResult, Notification, NotificationProducer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Hands threshold breaches to the delivery path without waiting on it
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Alerter: Send + Sync {
    fn notify(&self, notification: Notification) -> DomainResult<()>;
}

/// Alerter backed by a bounded queue drained by an `AlertDispatcher`
#[derive(Clone)]
pub struct QueuedAlerter {
    sender: mpsc::Sender<Notification>,
}

/// Create the alert queue. The receiver belongs to the dispatcher.
pub fn alert_queue(capacity: usize) -> (QueuedAlerter, mpsc::Receiver<Notification>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (QueuedAlerter { sender }, receiver)
}

impl Alerter for QueuedAlerter {
    fn notify(&self, notification: Notification) -> DomainResult<()> {
        match self.sender.try_send(notification) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    device_id = %dropped.device_id,
                    owner_id = %dropped.owner_id,
                    "alert queue full, dropping notification"
                );
                Err(DomainError::NotificationQueueFull(dropped.device_id))
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => Err(DomainError::RepositoryError(
                anyhow::anyhow!(
                    "alert dispatcher stopped, notification for {} not queued",
                    dropped.device_id
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertRetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Publishes queued notifications, retrying each a bounded number of times.
/// A notification that exhausts its attempts is logged and dropped.
pub struct AlertDispatcher {
    receiver: mpsc::Receiver<Notification>,
    producer: Arc<dyn NotificationProducer>,
    policy: AlertRetryPolicy,
}

impl AlertDispatcher {
    pub fn new(
        receiver: mpsc::Receiver<Notification>,
        producer: Arc<dyn NotificationProducer>,
        policy: AlertRetryPolicy,
    ) -> Self {
        Self {
            receiver,
            producer,
            policy,
        }
    }

    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(
            max_attempts = self.policy.max_attempts,
            "starting alert dispatcher"
        );

        loop {
            let notification = tokio::select! {
                _ = ctx.cancelled() => break,
                received = self.receiver.recv() => match received {
                    Some(notification) => notification,
                    None => break,
                },
            };
            self.deliver(&notification, &ctx).await;
        }

        let undelivered = self.receiver.len();
        if undelivered > 0 {
            warn!(undelivered, "alert dispatcher stopped with queued notifications");
        }
        info!("alert dispatcher stopped");
        Ok(())
    }

    /// Returns whether the notification was published
    #[instrument(skip(self, notification, ctx), fields(device_id = %notification.device_id, owner_id = %notification.owner_id))]
    pub async fn deliver(&self, notification: &Notification, ctx: &CancellationToken) -> bool {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.producer.publish_notification(notification).await {
                Ok(()) => {
                    debug!(attempt, "notification published");
                    return true;
                }
                Err(e) if attempt < max_attempts => {
                    warn!(attempt, error = %e, "notification publish failed, retrying");
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(self.policy.retry_delay) => {}
                    }
                }
                Err(e) => {
                    error!(attempts = max_attempts, error = %e, "giving up on notification");
                }
            }
        }
        false
    }
}
