use crate::DRIVER;
use async_trait::async_trait;
use jobs::{
    Ack, Acknowledger, Counters, Driver, DriverFactory, Item, Job, JobsError, Lifecycle,
    ListenConfig, Listeners, Operation, Pipeline, PipelineCell, PriorityQueue, Rejected, Source,
    State, bound_pipeline, listen,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

const DEFAULT_PREFETCH: u64 = 100_000;

/// Upper bound on one listener receive
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Jobs moved into the priority queue per receive
const BATCH: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFactory;

impl DriverFactory for MemoryFactory {
    fn kind(&self) -> &str {
        DRIVER
    }

    fn build(&self, queue: Arc<PriorityQueue>) -> Result<Arc<dyn Driver>, JobsError> {
        Ok(Arc::new(MemoryDriver::new(queue)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    max_delay: u64,
    prefetch: i64,
}

impl Settings {
    fn from_pipeline(pipeline: &Pipeline) -> Result<Self, JobsError> {
        let prefetch = pipeline.option_u64("prefetch", DEFAULT_PREFETCH)?;
        if prefetch == 0 {
            return Err(JobsError::config(format!(
                "pipeline `{}`: prefetch must be positive",
                pipeline.name
            )));
        }
        Ok(Self {
            max_delay: pipeline.option_u64("max_delay", 0)?,
            prefetch: i64::try_from(prefetch).unwrap_or(i64::MAX),
        })
    }
}

/// State shared by the driver, its listener and every outstanding ack
struct Shared {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    counters: Counters,
    /// Delay timers; only stopped with the driver
    timers: Listeners,
    settings: OnceLock<Settings>,
    closed: AtomicBool,
}

impl Shared {
    fn enqueue(self: &Arc<Self>, job: Job) -> Result<(), JobsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JobsError::NotRunning("memory consumer was stopped".into()));
        }

        if !job.is_delayed() {
            self.counters.add_active(1);
            if self.tx.send(job).is_err() {
                self.counters.add_active(-1);
                return Err(JobsError::Closed);
            }
            return Ok(());
        }

        self.counters.add_delayed(1);
        let shared = self.clone();
        self.timers.spawn(move |cancel| async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(job.delay()) => {
                    debug!(job_id = %job.id, "delayed job due");
                    shared.counters.promote(1);
                    if shared.tx.send(job).is_err() {
                        shared.counters.add_active(-1);
                    }
                }
            }
        });
        Ok(())
    }

    fn prefetch(&self) -> i64 {
        self.settings
            .get()
            .map_or(DEFAULT_PREFETCH as i64, |s| s.prefetch)
    }
}

/// Listener side of the channel
struct MemorySource {
    shared: Arc<Shared>,
}

#[async_trait]
impl Source for MemorySource {
    type Raw = Job;

    async fn receive(&self, wait: Duration) -> Result<Vec<Job>, JobsError> {
        let room = self.shared.prefetch() - self.shared.counters.reserved();
        if room <= 0 {
            tokio::time::sleep(wait).await;
            return Ok(Vec::new());
        }
        let limit = usize::try_from(room).unwrap_or(BATCH).min(BATCH);

        let mut rx = self.shared.rx.lock().await;
        let first = match tokio::time::timeout(wait, rx.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => return Err(JobsError::Closed),
            Ok(Some(job)) => job,
        };

        let mut batch = Vec::with_capacity(limit);
        batch.push(first);
        while batch.len() < limit {
            match rx.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn accept(&self, job: Job) -> Result<Item, Rejected<Job>> {
        self.shared.counters.reserve(1);
        let ack = MemoryAck {
            shared: self.shared.clone(),
            job: job.clone(),
        };
        Ok(Item::new(job, Ack::new(ack)))
    }

    // Jobs are never serialized, so nothing can be malformed
    async fn discard(&self, _job: Job) {}
}

struct MemoryAck {
    shared: Arc<Shared>,
    job: Job,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(&self) -> Result<(), JobsError> {
        self.shared.counters.add_reserved(-1);
        Ok(())
    }

    async fn nack(&self, requeue: bool, delay_seconds: u64) -> Result<(), JobsError> {
        self.shared.counters.add_reserved(-1);
        if requeue {
            return self.shared.enqueue(self.job.retried(delay_seconds));
        }
        error!(
            job_id = %self.job.id,
            pipeline = %self.job.pipeline(),
            attempt = self.job.attempt,
            "job failed and was dropped, memory driver has no dead-letter queue"
        );
        Ok(())
    }

    async fn requeue(&self) -> Result<(), JobsError> {
        self.shared.counters.add_reserved(-1);
        let mut job = self.job.clone();
        job.options.delay_seconds = 0;
        self.shared.enqueue(job)
    }
}

/// Ephemeral consumer bound to one pipeline
pub struct MemoryDriver {
    queue: Arc<PriorityQueue>,
    lifecycle: Lifecycle,
    pipeline: PipelineCell,
    listeners: Listeners,
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new(queue: Arc<PriorityQueue>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            queue,
            lifecycle: Lifecycle::new(DRIVER),
            pipeline: PipelineCell::new(),
            listeners: Listeners::new(),
            shared: Arc::new(Shared {
                tx,
                rx: Mutex::new(rx),
                counters: Counters::new(),
                timers: Listeners::new(),
                settings: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn spawn_listener(&self, pipeline: &str) {
        let source = Arc::new(MemorySource {
            shared: self.shared.clone(),
        });
        let queue = self.queue.clone();
        let config = ListenConfig::new(pipeline).with_wait(RECEIVE_WAIT);
        self.listeners
            .spawn(move |cancel| listen(source, queue, cancel, config));
    }

    fn bound_name(&self) -> String {
        self.pipeline.name().unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn push(&self, job: Job) -> Result<(), JobsError> {
        self.validate(&job)?;
        self.shared.enqueue(job)
    }

    fn validate(&self, job: &Job) -> Result<(), JobsError> {
        let settings = self
            .shared
            .settings
            .get()
            .ok_or_else(|| JobsError::NotRunning("memory consumer is not registered".into()))?;
        job.validate_delay(settings.max_delay)
    }

    async fn register(&self, pipeline: Pipeline) -> Result<(), JobsError> {
        let Some(guard) = self
            .lifecycle
            .begin(Operation::Register, &pipeline.name)
            .await?
        else {
            return Ok(());
        };

        let settings = Settings::from_pipeline(&pipeline)?;
        let _ = self.shared.settings.set(settings);
        self.pipeline.store(pipeline);
        guard.commit();
        Ok(())
    }

    async fn run(&self, pipeline: &Pipeline) -> Result<(), JobsError> {
        let snapshot = bound_pipeline(&self.pipeline, &pipeline.name)?;
        if let Some(guard) = self.lifecycle.begin(Operation::Run, &pipeline.name).await? {
            self.spawn_listener(&snapshot.pipeline.name);
            guard.commit();
        }
        Ok(())
    }

    async fn pause(&self, pipeline: &str) {
        if let Err(e) = bound_pipeline(&self.pipeline, pipeline) {
            warn!(driver = DRIVER, error = %e, "pause ignored");
            return;
        }
        match self.lifecycle.begin(Operation::Pause, pipeline).await {
            Ok(Some(guard)) => {
                self.listeners.stop().await;
                guard.commit();
            }
            Ok(None) => {}
            Err(e) => warn!(driver = DRIVER, pipeline = %pipeline, error = %e, "pause ignored"),
        }
    }

    async fn resume(&self, pipeline: &str) {
        if let Err(e) = bound_pipeline(&self.pipeline, pipeline) {
            warn!(driver = DRIVER, error = %e, "resume ignored");
            return;
        }
        match self.lifecycle.begin(Operation::Resume, pipeline).await {
            Ok(Some(guard)) => {
                self.spawn_listener(pipeline);
                guard.commit();
            }
            Ok(None) => {}
            Err(e) => warn!(driver = DRIVER, pipeline = %pipeline, error = %e, "resume ignored"),
        }
    }

    async fn stop(&self) -> Result<(), JobsError> {
        let name = self.bound_name();
        let Some(guard) = self.lifecycle.begin(Operation::Stop, &name).await? else {
            return Ok(());
        };

        self.shared.closed.store(true, Ordering::Release);
        self.listeners.stop().await;
        self.shared.timers.stop().await;

        let mut dropped = 0usize;
        {
            let mut rx = self.shared.rx.lock().await;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(driver = DRIVER, pipeline = %name, dropped, "undelivered jobs dropped on stop");
        }
        self.shared.counters.set_active(0);
        self.shared.counters.set_delayed(0);

        guard.commit();
        Ok(())
    }

    fn state(&self) -> State {
        let (name, priority) = self
            .pipeline
            .load()
            .map(|s| (s.pipeline.name.clone(), s.pipeline.priority))
            .unwrap_or_default();
        let counters = &self.shared.counters;

        State {
            pipeline: name.clone(),
            driver: DRIVER.to_string(),
            queue_name: name,
            priority,
            active_count: counters.active(),
            delayed_count: counters.delayed(),
            reserved_count: counters.reserved(),
            ready: self.listeners.ready(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs::{CancellationToken, ErrorKind};
    use tokio::time::Instant;

    async fn running(pipeline: Pipeline) -> (MemoryDriver, Arc<PriorityQueue>) {
        let queue = Arc::new(PriorityQueue::new());
        let driver = MemoryDriver::new(queue.clone());
        driver.register(pipeline.clone()).await.unwrap();
        driver.run(&pipeline).await.unwrap();
        (driver, queue)
    }

    #[tokio::test]
    async fn test_push_requires_registration() {
        let driver = MemoryDriver::new(Arc::new(PriorityQueue::new()));
        let err = driver.push(Job::new("a", "")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_registration() {
        let driver = MemoryDriver::new(Arc::new(PriorityQueue::new()));
        let err = driver
            .register(Pipeline::new("p", DRIVER).with_option("prefetch", "many"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_delivers_and_counts() {
        let (driver, queue) = running(Pipeline::new("p", DRIVER)).await;
        driver.push(Job::new("a", "").on_pipeline("p")).await.unwrap();

        let item = queue.pop(&CancellationToken::new()).await.unwrap();
        assert_eq!(item.job().name, "a");
        let state = driver.state();
        assert_eq!((state.active_count, state.reserved_count), (0, 1));
        assert!(state.ready);

        item.ack().await.unwrap();
        assert_eq!(driver.state().reserved_count, 0);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_delay_is_enforced() {
        let (driver, _) = running(Pipeline::new("p", DRIVER).with_option("max_delay", 10)).await;
        let err = driver
            .push(Job::new("a", "").on_pipeline("p").with_delay(11))
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::InvalidDelay { requested: 11, max: 10 });
        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_waits() {
        let (driver, queue) = running(Pipeline::new("p", DRIVER)).await;
        let started = Instant::now();
        driver
            .push(Job::new("later", "").on_pipeline("p").with_delay(2))
            .await
            .unwrap();
        assert_eq!(driver.state().delayed_count, 1);

        let item = queue.pop(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(item.job().name, "later");
        assert_eq!(driver.state().delayed_count, 0);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_requeues_with_attempt() {
        let (driver, queue) = running(Pipeline::new("p", DRIVER)).await;
        driver.push(Job::new("a", "").on_pipeline("p")).await.unwrap();

        let cancel = CancellationToken::new();
        queue.pop(&cancel).await.unwrap().nack(true, 0).await.unwrap();
        let again = queue.pop(&cancel).await.unwrap();
        assert_eq!(again.job().attempt, 1);

        again.nack(false, 0).await.unwrap();
        assert_eq!(driver.state().reserved_count, 0);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_keeps_jobs_until_resume() {
        let (driver, queue) = running(Pipeline::new("p", DRIVER)).await;
        driver.pause("p").await;
        driver.pause("p").await;
        assert!(!driver.state().ready);

        driver.push(Job::new("a", "").on_pipeline("p")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());
        assert_eq!(driver.state().active_count, 1);

        driver.resume("p").await;
        assert!(driver.state().ready);
        let item = queue.pop(&CancellationToken::new()).await.unwrap();
        assert_eq!(item.job().name, "a");
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_and_rejects_pushes() {
        let (driver, _) = running(Pipeline::new("p", DRIVER)).await;
        driver.stop().await.unwrap();
        driver.stop().await.unwrap();

        assert!(!driver.state().ready);
        let err = driver.push(Job::new("a", "").on_pipeline("p")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert!(driver.run(&Pipeline::new("p", DRIVER)).await.is_err());
    }
}
