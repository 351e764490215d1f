//! Acknowledgement capability handed out with every popped job.

use crate::error::JobsError;
use crate::job::Job;
use async_trait::async_trait;
use std::fmt;

/// Settles one delivery with the driver that produced it.
///
/// Implementations are bound to a single delivery. [`Ack`] guarantees that
/// exactly one of the methods is called per delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The job was processed; forget it.
    async fn ack(&self) -> Result<(), JobsError>;

    /// The job failed. With `requeue` it is redelivered after
    /// `delay_seconds`, otherwise it is dead-lettered (or dropped when the
    /// backend has no dead-letter concept).
    async fn nack(&self, requeue: bool, delay_seconds: u64) -> Result<(), JobsError>;

    /// Put the job back for immediate redelivery without counting a failure.
    async fn requeue(&self) -> Result<(), JobsError>;
}

/// Owned handle to an [`Acknowledger`]. Every method consumes it.
pub struct Ack {
    inner: Box<dyn Acknowledger>,
}

impl Ack {
    pub fn new(inner: impl Acknowledger + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub async fn ack(self) -> Result<(), JobsError> {
        self.inner.ack().await
    }

    pub async fn nack(self, requeue: bool, delay_seconds: u64) -> Result<(), JobsError> {
        self.inner.nack(requeue, delay_seconds).await
    }

    pub async fn requeue(self) -> Result<(), JobsError> {
        self.inner.requeue().await
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack").finish_non_exhaustive()
    }
}

/// Priority queue entry: a ready job and the way to settle it.
#[derive(Debug)]
pub struct Item {
    job: Job,
    ack: Ack,
}

impl Item {
    pub fn new(job: Job, ack: Ack) -> Self {
        Self { job, ack }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn priority(&self) -> i64 {
        self.job.options.priority
    }

    pub fn pipeline(&self) -> &str {
        &self.job.options.pipeline
    }

    pub fn into_parts(self) -> (Job, Ack) {
        (self.job, self.ack)
    }

    pub async fn ack(self) -> Result<(), JobsError> {
        self.ack.ack().await
    }

    pub async fn nack(self, requeue: bool, delay_seconds: u64) -> Result<(), JobsError> {
        self.ack.nack(requeue, delay_seconds).await
    }
}

/// Acknowledger for deliveries that need no settlement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAck;

#[async_trait]
impl Acknowledger for NoopAck {
    async fn ack(&self) -> Result<(), JobsError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool, _delay_seconds: u64) -> Result<(), JobsError> {
        Ok(())
    }

    async fn requeue(&self) -> Result<(), JobsError> {
        Ok(())
    }
}
