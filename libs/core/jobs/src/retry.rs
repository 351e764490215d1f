//! Backoff strategies and the requeue/dead-letter decision.

use crate::error::{ErrorCategory, HandlerError};
use crate::job::Job;
use std::time::Duration;

/// Backoff strategy for retries and redials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed(Duration),

    /// Exponential backoff (base * 2^attempt, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (attempt + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(attempt));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(attempt.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}

/// What to do with a job whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue { delay_seconds: u64 },
    DeadLetter,
}

impl Disposition {
    /// Arguments for `Acknowledger::nack`
    pub fn as_nack(&self) -> (bool, u64) {
        match self {
            Disposition::Requeue { delay_seconds } => (true, *delay_seconds),
            Disposition::DeadLetter => (false, 0),
        }
    }
}

/// Decide between requeue and dead-letter.
///
/// A job is requeued only when it opted in with `requeue_on_fail`, the
/// failure is retryable and attempts remain. Delays are rounded up to whole
/// seconds.
pub fn decide(job: &Job, error: &HandlerError, backoff: &BackoffStrategy) -> Disposition {
    if !job.options.requeue_on_fail || !error.category.is_retryable() || !job.can_retry() {
        return Disposition::DeadLetter;
    }

    let factor = error.category.delay_factor().max(1);
    let delay = backoff.delay(job.attempt).saturating_mul(factor);
    let mut delay_seconds = delay.as_secs();
    if delay.subsec_nanos() > 0 {
        delay_seconds += 1;
    }
    if error.category == ErrorCategory::RateLimited {
        delay_seconds = delay_seconds.max(1);
    }

    Disposition::Requeue { delay_seconds }
}
