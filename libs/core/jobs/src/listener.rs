//! Listener tasks shared by every adapter.
//!
//! [`Listeners`] owns the tasks of one adapter. Stopping them cancels a
//! shared token and waits on a task tracker, so callers never count how
//! many tasks are running. [`listen`] is the receive loop each adapter
//! plugs its backend into through [`Source`].

use crate::ack::Item;
use crate::error::JobsError;
use crate::priority_queue::PriorityQueue;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A set of tasks that are stopped together.
#[derive(Debug)]
pub struct Listeners {
    token: Mutex<CancellationToken>,
    tracker: TaskTracker,
    running: Arc<AtomicUsize>,
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawn a task that receives the group's cancellation token
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.current_token();
        self.running.fetch_add(1, Ordering::AcqRel);
        let guard = RunningGuard(self.running.clone());
        let fut = task(token);
        self.tracker.spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    /// Number of tasks still running
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn ready(&self) -> bool {
        self.running() > 0
    }

    /// Cancel every task and wait for all of them to exit. The group can
    /// spawn again afterwards.
    pub async fn stop(&self) {
        let token = {
            let mut current = self.token.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, CancellationToken::new())
        };
        token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// A message that failed to decode, handed back for disposal
pub struct Rejected<R> {
    pub raw: R,
    pub error: JobsError,
}

/// Backend side of the receive loop.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    type Raw: Send + 'static;

    /// Block for at most `wait` for the next messages. An empty batch means
    /// nothing arrived in time.
    async fn receive(&self, wait: Duration) -> Result<Vec<Self::Raw>, JobsError>;

    /// Decode and bind an acknowledger to this delivery
    fn accept(&self, raw: Self::Raw) -> Result<Item, Rejected<Self::Raw>>;

    /// Permanently remove a malformed message so it is never redelivered
    async fn discard(&self, raw: Self::Raw);

    /// The receive failed because the connection is gone. Return `true` once
    /// a replacement connection is usable to keep listening, `false` to exit.
    async fn connection_lost(&self, error: JobsError) -> bool {
        error!(error = %error, "connection lost, listener exiting");
        false
    }
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub pipeline: String,
    /// Upper bound on a single receive
    pub wait: Duration,
    /// Pause after a failed receive before trying again
    pub error_backoff: Duration,
}

impl ListenConfig {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Receive from `source` into `queue` until `cancel` fires.
///
/// Decode failures are logged and discarded. Transient receive errors are
/// logged and retried. A connection error is handed to
/// [`Source::connection_lost`], which decides whether the loop goes on.
pub async fn listen<S: Source>(
    source: Arc<S>,
    queue: Arc<PriorityQueue>,
    cancel: CancellationToken,
    config: ListenConfig,
) {
    info!(pipeline = %config.pipeline, "listener started");

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.receive(config.wait) => result,
        };

        match received {
            Ok(batch) => {
                for raw in batch {
                    match source.accept(raw) {
                        Ok(item) => {
                            debug!(pipeline = %config.pipeline, job_id = %item.job().id, "job ready");
                            queue.insert(item);
                        }
                        Err(Rejected { raw, error }) => {
                            warn!(
                                pipeline = %config.pipeline,
                                error = %error,
                                "failed to decode job, discarding"
                            );
                            source.discard(raw).await;
                        }
                    }
                }
            }
            Err(error) if error.is_connection() => {
                let resumed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    resumed = source.connection_lost(error) => resumed,
                };
                if !resumed {
                    break;
                }
                info!(pipeline = %config.pipeline, "listener resumed on new connection");
            }
            Err(error) => {
                warn!(pipeline = %config.pipeline, error = %error, "receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    info!(pipeline = %config.pipeline, "listener stopped");
}
