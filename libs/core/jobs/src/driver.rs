//! Consumer contract every backend adapter implements, plus the lifecycle
//! state machine they share.
//!
//! ```text
//! Unregistered --register--> Registered --run--> Running <--resume-- Paused
//!                                                   |                  ^
//!                                                   +------pause-------+
//! any --stop--> Stopped
//! ```
//!
//! Redundant transitions (run/resume while running, pause/stop while not
//! running) are logged and ignored rather than failing the caller.

use crate::error::JobsError;
use crate::job::Job;
use crate::pipeline::{Pipeline, PipelineCell, PipelineSnapshot};
use crate::priority_queue::PriorityQueue;
use crate::state::State;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use strum::{AsRefStr, Display, EnumString, FromRepr};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// One backend adapter bound to exactly one pipeline.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Encode and hand the job to the backend. Delays beyond the backend's
    /// maximum fail with [`JobsError::InvalidDelay`].
    async fn push(&self, job: Job) -> Result<(), JobsError>;

    /// Check `job` against the backend's limits without sending it. `push`
    /// runs the same check.
    fn validate(&self, job: &Job) -> Result<(), JobsError>;

    /// Bind and validate configuration. Opens no backend resources.
    async fn register(&self, pipeline: Pipeline) -> Result<(), JobsError>;

    /// Open backend resources and start listening.
    async fn run(&self, pipeline: &Pipeline) -> Result<(), JobsError>;

    async fn pause(&self, pipeline: &str);

    async fn resume(&self, pipeline: &str);

    /// Release every backend resource, even if listeners already died.
    async fn stop(&self) -> Result<(), JobsError>;

    fn state(&self) -> State;
}

/// Builds unbound drivers of one kind.
pub trait DriverFactory: Send + Sync {
    /// Driver name pipelines refer to (`"memory"`, `"redis"`, ...)
    fn kind(&self) -> &str;

    fn build(&self, queue: Arc<PriorityQueue>) -> Result<Arc<dyn Driver>, JobsError>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString, FromRepr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Unregistered,
    Registered,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Register,
    Run,
    Pause,
    Resume,
    Stop,
}

/// Outcome of checking an operation against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(LifecycleState),
    Ignore,
}

impl LifecycleState {
    pub fn transition(self, op: Operation) -> Result<Transition, JobsError> {
        use LifecycleState::*;

        match (op, self) {
            (Operation::Register, Unregistered) => Ok(Transition::To(Registered)),
            (Operation::Register, state) => Err(JobsError::config(format!(
                "consumer already registered (state: {state})"
            ))),

            (Operation::Run, Registered | Paused) => Ok(Transition::To(Running)),
            (Operation::Run, Running) => Ok(Transition::Ignore),
            (Operation::Run, Unregistered) => {
                Err(JobsError::config("consumer must be registered before run"))
            }
            (Operation::Run, Stopped) => Err(JobsError::NotRunning("consumer was stopped".into())),

            (Operation::Pause, Running) => Ok(Transition::To(Paused)),
            (Operation::Resume, Paused) => Ok(Transition::To(Running)),
            (Operation::Pause | Operation::Resume, _) => Ok(Transition::Ignore),

            (Operation::Stop, Stopped) => Ok(Transition::Ignore),
            (Operation::Stop, _) => Ok(Transition::To(Stopped)),
        }
    }
}

/// Serializes lifecycle operations of one adapter.
///
/// [`Lifecycle::begin`] holds the adapter's lifecycle lock until the
/// returned guard is committed or dropped, so pause/resume/stop never
/// interleave. The current state is mirrored into an atomic for cheap reads
/// from `state()`.
#[derive(Debug)]
pub struct Lifecycle {
    driver: &'static str,
    lock: Mutex<LifecycleState>,
    current: AtomicU8,
}

/// An approved transition waiting to be committed
pub struct LifecycleGuard<'a> {
    guard: MutexGuard<'a, LifecycleState>,
    lifecycle: &'a Lifecycle,
    target: LifecycleState,
    op: Operation,
    pipeline: String,
    started: Instant,
}

impl Lifecycle {
    pub fn new(driver: &'static str) -> Self {
        Self {
            driver,
            lock: Mutex::new(LifecycleState::Unregistered),
            current: AtomicU8::new(LifecycleState::Unregistered as u8),
        }
    }

    pub fn current(&self) -> LifecycleState {
        LifecycleState::from_repr(self.current.load(Ordering::Acquire))
            .unwrap_or(LifecycleState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.current() == LifecycleState::Running
    }

    /// Check `op` against the current state. `Ok(None)` means the operation
    /// is redundant and was logged; the caller should return without effect.
    pub async fn begin(
        &self,
        op: Operation,
        pipeline: &str,
    ) -> Result<Option<LifecycleGuard<'_>>, JobsError> {
        let guard = self.lock.lock().await;
        let state = *guard;

        match state.transition(op)? {
            Transition::Ignore => {
                warn!(
                    driver = self.driver,
                    pipeline = %pipeline,
                    state = %state,
                    operation = %op,
                    "redundant lifecycle operation ignored"
                );
                Ok(None)
            }
            Transition::To(target) => Ok(Some(LifecycleGuard {
                guard,
                lifecycle: self,
                target,
                op,
                pipeline: pipeline.to_string(),
                started: Instant::now(),
            })),
        }
    }
}

impl LifecycleGuard<'_> {
    pub fn target(&self) -> LifecycleState {
        self.target
    }

    /// The state before this transition
    pub fn previous(&self) -> LifecycleState {
        *self.guard
    }

    /// Apply the transition after the driver finished its side effects
    pub fn commit(mut self) {
        *self.guard = self.target;
        self.lifecycle
            .current
            .store(self.target as u8, Ordering::Release);

        let message = match self.op {
            Operation::Register => "pipeline registered",
            Operation::Run => "pipeline active",
            Operation::Pause => "pipeline paused",
            Operation::Resume => "pipeline resumed",
            Operation::Stop => "pipeline stopped",
        };
        debug!(
            driver = self.lifecycle.driver,
            pipeline = %self.pipeline,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "{message}"
        );
    }
}

/// The bound pipeline, checked against the name a caller addressed
pub fn bound_pipeline(cell: &PipelineCell, name: &str) -> Result<Arc<PipelineSnapshot>, JobsError> {
    match cell.load() {
        Some(snapshot) if snapshot.pipeline.name == name => Ok(snapshot),
        Some(snapshot) => Err(JobsError::NoSuchPipeline(format!(
            "{name} (consumer is bound to {})",
            snapshot.pipeline.name
        ))),
        None => Err(JobsError::NoSuchPipeline(name.to_string())),
    }
}
