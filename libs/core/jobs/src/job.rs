//! The unit of work flowing through the broker.

use crate::error::JobsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// A job and its delivery metadata.
///
/// The payload is opaque: nothing in the broker inspects it. Jobs are
/// encoded as JSON when a backend needs bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id, generated on push when empty
    #[serde(default)]
    pub id: String,

    /// Job name, used by handlers for routing
    pub name: String,

    #[serde(default)]
    pub payload: Vec<u8>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub options: Options,

    /// Number of failed deliveries so far
    #[serde(default)]
    pub attempt: u32,
}

/// Per-job delivery options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Target pipeline name
    pub pipeline: String,

    /// Higher is served first. Zero inherits the pipeline priority.
    pub priority: i64,

    pub delay_seconds: u64,

    /// Total deliveries allowed before dead-lettering (0 = unlimited)
    pub max_attempts: u32,

    /// Requeue instead of dead-lettering when the handler fails
    pub requeue_on_fail: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pipeline: String::new(),
            priority: 0,
            delay_seconds: 0,
            max_attempts: 3,
            requeue_on_fail: false,
        }
    }
}

/// Generate a time-ordered job id
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

impl Job {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            options: Options::default(),
            attempt: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn on_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.options.pipeline = pipeline.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.options.delay_seconds = seconds;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.options.max_attempts = attempts;
        self
    }

    pub fn requeue_on_fail(mut self, requeue: bool) -> Self {
        self.options.requeue_on_fail = requeue;
        self
    }

    /// Assign a generated id if the job has none
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = generate_id();
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.options.pipeline
    }

    pub fn priority(&self) -> i64 {
        self.options.priority
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.options.delay_seconds)
    }

    pub fn is_delayed(&self) -> bool {
        self.options.delay_seconds > 0
    }

    /// Whether another delivery is allowed after the current one fails
    pub fn can_retry(&self) -> bool {
        self.options.max_attempts == 0 || self.attempt + 1 < self.options.max_attempts
    }

    /// Copy for redelivery with the attempt counter bumped and the delay replaced
    pub fn retried(&self, delay_seconds: u64) -> Self {
        let mut job = self.clone();
        job.attempt = job.attempt.saturating_add(1);
        job.options.delay_seconds = delay_seconds;
        job
    }

    /// Reject delays the backend cannot honour (`max == 0` means unbounded)
    pub fn validate_delay(&self, max: u64) -> Result<(), JobsError> {
        if max > 0 && self.options.delay_seconds > max {
            return Err(JobsError::InvalidDelay {
                requested: self.options.delay_seconds,
                max,
            });
        }
        Ok(())
    }

    /// Append the JSON encoding to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), JobsError> {
        serde_json::to_writer(buf, self).map_err(|e| JobsError::Encode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, JobsError> {
        let mut buf = Vec::with_capacity(256);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, JobsError> {
        let mut job: Job =
            serde_json::from_slice(bytes).map_err(|e| JobsError::Decode(e.to_string()))?;
        job.ensure_id();
        Ok(job)
    }
}
