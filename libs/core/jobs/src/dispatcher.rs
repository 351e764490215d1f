//! Reference consumer of the priority queue.
//!
//! The dispatcher pops jobs in priority order, runs them through a
//! [`Handler`] with bounded concurrency, and settles each delivery through
//! its acknowledger: `ack` on success, otherwise requeue or dead-letter as
//! decided by [`decide`].

use crate::ack::Item;
use crate::error::HandlerError;
use crate::job::Job;
use crate::priority_queue::PriorityQueue;
use crate::retry::{BackoffStrategy, Disposition, decide};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Application code that executes jobs.
///
/// ```rust,ignore
/// struct SendEmail { mailer: Arc<Mailer> }
///
/// #[async_trait]
/// impl Handler for SendEmail {
///     async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
///         let email: Email = serde_json::from_slice(&job.payload)
///             .map_err(|e| HandlerError::permanent(e.to_string()))?;
///         self.mailer.send(&email).await.map_err(|e| HandlerError::transient(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "send_email"
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;

    /// Used in log fields
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Jobs handled at the same time
    pub concurrency: usize,
    /// Delay schedule for requeued jobs
    pub backoff: BackoffStrategy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    ok: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    settle_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub ok: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub settle_failed: u64,
}

pub struct Dispatcher<H: Handler> {
    queue: Arc<PriorityQueue>,
    handler: Arc<H>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(queue: Arc<PriorityQueue>, handler: H, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            permits,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            ok: self.counters.ok.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            settle_failed: self.counters.settle_failed.load(Ordering::Relaxed),
        }
    }

    /// Dispatch until `cancel` fires, then wait for in-flight jobs.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            handler = self.handler.name(),
            concurrency = self.config.concurrency,
            "dispatcher started"
        );

        let mut in_flight = JoinSet::new();

        loop {
            // Reap finished tasks so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(item) = self.queue.pop(&cancel).await else {
                break;
            };

            let handler = self.handler.clone();
            let counters = self.counters.clone();
            let backoff = self.config.backoff.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                process(item, handler.as_ref(), &backoff, &counters).await;
            });
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "waiting for in-flight jobs");
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "job task panicked");
            }
        }
        info!(handler = self.handler.name(), "dispatcher stopped");
    }
}

async fn process<H: Handler>(
    item: Item,
    handler: &H,
    backoff: &BackoffStrategy,
    counters: &Counters,
) {
    let started = Instant::now();
    let (job, ack) = item.into_parts();

    let settled = match handler.handle(&job).await {
        Ok(()) => {
            debug!(
                job_id = %job.id,
                pipeline = %job.pipeline(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job completed"
            );
            counters.ok.fetch_add(1, Ordering::Relaxed);
            ack.ack().await
        }
        Err(e) => {
            let disposition = decide(&job, &e, backoff);
            match disposition {
                Disposition::Requeue { delay_seconds } => {
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        delay_seconds,
                        error = %e,
                        "job failed, requeueing"
                    );
                    counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
                Disposition::DeadLetter => {
                    error!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        error = %e,
                        "job failed, dead-lettering"
                    );
                    counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
            }
            let (requeue, delay_seconds) = disposition.as_nack();
            ack.nack(requeue, delay_seconds).await
        }
    };

    if let Err(e) = settled {
        counters.settle_failed.fetch_add(1, Ordering::Relaxed);
        error!(job_id = %job.id, error = %e, "failed to settle job");
    }
}
