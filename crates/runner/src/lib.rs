//! Runs a set of named long-lived processes until shutdown, then runs closers.
//!
//! - Processes run concurrently on the tokio runtime
//! - SIGINT/SIGTERM cancels the shared token
//! - The first process to fail cancels the rest and makes the exit code non-zero
//! - Closers always run, bounded by a timeout
//!
//! # Example
//!
//! ```no_run
//! use meterline_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process("ticker", |ctx| async move {
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => tracing::info!("tick"),
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by processes and closers
pub type BoxedResultFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// A long-running process; receives the shared shutdown token
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedResultFuture + Send>;

/// Cleanup run after every process has stopped
pub type Closer = Box<dyn FnOnce() -> BoxedResultFuture + Send>;

struct NamedProcess {
    name: String,
    process: AppProcess,
}

/// How the processes ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Stopped by signal or external cancellation, or every process returned Ok
    Completed,
    /// A process failed or panicked
    Failed { process: String, error: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

pub struct Runner {
    processes: Vec<NamedProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Runner with no processes and a 10 second closer timeout
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Adds a process identified by `name` in logs and failure reports.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.processes.push(NamedProcess {
            name: name.into(),
            process: Box::new(move |token: CancellationToken| -> BoxedResultFuture {
                Box::pin(process(token))
            }),
        });
        self
    }

    /// Adds a closer. All closers run concurrently after the processes stop,
    /// even if some of them fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers
            .push(Box::new(move || -> BoxedResultFuture { Box::pin(closer()) }));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned token, e.g. to stop the runner from a test.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs until shutdown, then exits the process with the outcome's code.
    pub async fn run(self) {
        let outcome = self.run_until_stopped().await;
        match &outcome {
            RunOutcome::Completed => tracing::info!("Application exiting normally"),
            RunOutcome::Failed { process, error } => {
                tracing::error!(process = %process, error = %error, "Application exiting with error")
            }
        }
        std::process::exit(outcome.exit_code());
    }

    /// Runs processes and closers and reports how they ended, without exiting.
    pub async fn run_until_stopped(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for NamedProcess { name, process } in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                tracing::info!(process = %name, "starting process");
                let result = process(process_token).await;
                (name, result)
            });
        }

        spawn_signal_handlers(token.clone());

        let mut outcome = RunOutcome::Completed;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(process = %name, "process completed");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = %name, "process error: {:#}", err);
                    if matches!(outcome, RunOutcome::Completed) {
                        outcome = RunOutcome::Failed {
                            process: name,
                            error: format!("{err:#}"),
                        };
                    }
                    token.cancel();
                }
                Err(err) => {
                    tracing::error!("process panicked: {}", err);
                    if matches!(outcome, RunOutcome::Completed) {
                        outcome = RunOutcome::Failed {
                            process: "unknown".to_string(),
                            error: err.to_string(),
                        };
                    }
                    token.cancel();
                }
            }
        }

        if !self.closers.is_empty() {
            tracing::info!("Running closers with timeout of {:?}", self.closer_timeout);
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => tracing::info!("All closers completed"),
                Err(_) => tracing::error!("Closers timed out after {:?}", self.closer_timeout),
            }
        }

        outcome
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c_token.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    tracing::info!("Received shutdown signal");
                    ctrl_c_token.cancel();
                }
                Err(err) => tracing::error!("Error setting up signal handler: {}", err),
            },
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!("Error setting up SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
                token.cancel();
            }
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => tracing::debug!("Closer completed successfully"),
            Ok(Err(err)) => tracing::error!("Closer error: {:#}", err),
            Err(err) => tracing::error!("Closer panicked: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancellation_stops_processes_and_runs_closers() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&closed);
        let token = CancellationToken::new();
        let canceller = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = Runner::new()
            .with_named_process("waiter", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_closer(move || async move {
                closed_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token)
            .run_until_stopped()
            .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(outcome.exit_code(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_process_cancels_siblings() {
        let sibling_stopped = Arc::new(AtomicBool::new(false));
        let sibling_flag = Arc::clone(&sibling_stopped);

        let outcome = Runner::new()
            .with_named_process("reading_consumer", |_ctx| async move {
                Err(anyhow::anyhow!("store unavailable"))
            })
            .with_named_process("history_responder", move |ctx| async move {
                ctx.cancelled().await;
                sibling_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .run_until_stopped()
            .await;

        match &outcome {
            RunOutcome::Failed { process, error } => {
                assert_eq!(process, "reading_consumer");
                assert!(error.contains("store unavailable"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(outcome.exit_code(), 1);
        assert!(sibling_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closers_run_even_when_one_fails() {
        let completed = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&completed);
        let token = CancellationToken::new();
        token.cancel();

        Runner::new()
            .with_closer(|| async move { Err(anyhow::anyhow!("flush failed")) })
            .with_closer(move || async move {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token)
            .run_until_stopped()
            .await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
