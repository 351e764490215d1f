use crate::DRIVER;
use crate::store::DelayStore;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use jobs::{
    Ack, Acknowledger, BufferPool, CancellationToken, Counters, Driver, DriverFactory, Item, Job,
    JobsError, Lifecycle, LifecycleState, ListenConfig, Listeners, Operation, Pipeline,
    PipelineCell, PriorityQueue, Rejected, Source, State, bound_pipeline, listen,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const DEFAULT_DIR: &str = "./data/jobs";
const DEFAULT_PERMISSIONS: &str = "755";
const DEFAULT_PREFETCH: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_PROMOTE_INTERVAL_MS: u64 = 1000;

/// Jobs reserved per receive
const BATCH: usize = 100;

/// Longest accepted delay, one hundred years. Release keys need a four-digit
/// year to sort, so `max_delay` is clamped to this.
pub const MAX_DELAY_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Builds durable drivers whose files default to `{dir}/{pipeline}.db`
#[derive(Debug, Clone)]
pub struct DurableFactory {
    dir: PathBuf,
}

impl Default for DurableFactory {
    fn default() -> Self {
        Self::new(DEFAULT_DIR)
    }
}

impl DurableFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DriverFactory for DurableFactory {
    fn kind(&self) -> &str {
        DRIVER
    }

    fn build(&self, queue: Arc<PriorityQueue>) -> Result<Arc<dyn Driver>, JobsError> {
        Ok(Arc::new(DurableDriver::new(queue, self.dir.clone())))
    }
}

#[derive(Debug, Clone)]
struct Settings {
    path: PathBuf,
    permissions: u32,
    max_delay: u64,
    prefetch: i64,
    poll_interval: Duration,
    promote_interval: Duration,
}

impl Settings {
    fn from_pipeline(pipeline: &Pipeline, dir: &std::path::Path) -> Result<Self, JobsError> {
        let path = match pipeline.option_str("path", "") {
            p if p.is_empty() => dir.join(format!("{}.db", pipeline.name)),
            p => PathBuf::from(p),
        };

        let permissions = pipeline.option_str("permissions", DEFAULT_PERMISSIONS);
        let permissions = u32::from_str_radix(permissions.trim(), 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| {
                JobsError::config(format!(
                    "pipeline `{}`: permissions `{permissions}` is not an octal file mode",
                    pipeline.name
                ))
            })?;

        let prefetch = pipeline.option_u64("prefetch", DEFAULT_PREFETCH)?.max(1);
        let poll_interval = pipeline.option_duration_ms("poll_interval_ms", DEFAULT_POLL_INTERVAL_MS)?;
        let promote_interval =
            pipeline.option_duration_ms("promote_interval_ms", DEFAULT_PROMOTE_INTERVAL_MS)?;
        if poll_interval.is_zero() || promote_interval.is_zero() {
            return Err(JobsError::config(format!(
                "pipeline `{}`: poll and promote intervals must be positive",
                pipeline.name
            )));
        }

        let max_delay = match pipeline.option_u64("max_delay", 0)? {
            0 => MAX_DELAY_SECONDS,
            requested if requested > MAX_DELAY_SECONDS => {
                warn!(
                    driver = DRIVER,
                    pipeline = %pipeline.name,
                    requested,
                    max = MAX_DELAY_SECONDS,
                    "max_delay clamped"
                );
                MAX_DELAY_SECONDS
            }
            requested => requested,
        };

        Ok(Self {
            path,
            permissions,
            max_delay,
            prefetch: i64::try_from(prefetch).unwrap_or(i64::MAX),
            poll_interval,
            promote_interval,
        })
    }
}

struct Shared {
    store: RwLock<Option<Arc<DelayStore>>>,
    counters: Counters,
    pool: BufferPool,
    /// Wakes the listener when new jobs become ready
    ready: Notify,
    settings: OnceLock<Settings>,
}

impl Shared {
    fn store(&self) -> Result<Arc<DelayStore>, JobsError> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| JobsError::NotRunning("durable store is not open".into()))
    }

    fn settings(&self) -> Result<&Settings, JobsError> {
        self.settings
            .get()
            .ok_or_else(|| JobsError::NotRunning("durable consumer is not registered".into()))
    }

    /// Write a new job to `push` or `delay`
    fn insert(&self, job: &Job) -> Result<(), JobsError> {
        let store = self.store()?;
        let mut buf = self.pool.acquire(job.payload.len() + 256);
        job.encode_into(&mut buf)?;

        if job.is_delayed() {
            let release = release_at(Utc::now(), job.options.delay_seconds)?;
            store.delay(release, &job.id, &buf)?;
            self.counters.add_delayed(1);
        } else {
            store.push(&job.id, &buf)?;
            self.counters.add_active(1);
            self.ready.notify_one();
        }
        Ok(())
    }

    /// Return a reserved job to `push` or `delay`
    fn requeue(&self, id: &str, job: &Job) -> Result<(), JobsError> {
        let store = self.store()?;
        let mut buf = self.pool.acquire(job.payload.len() + 256);
        job.encode_into(&mut buf)?;

        let release = match job.is_delayed() {
            true => Some(release_at(Utc::now(), job.options.delay_seconds)?),
            false => None,
        };
        store.requeue(id, &buf, release)?;

        self.counters.add_reserved(-1);
        if release.is_some() {
            self.counters.add_delayed(1);
        } else {
            self.counters.add_active(1);
            self.ready.notify_one();
        }
        Ok(())
    }
}

/// Release time `delay_seconds` after `now`. Times past year 9999 are
/// refused, their keys would not sort.
fn release_at(now: DateTime<Utc>, delay_seconds: u64) -> Result<DateTime<Utc>, JobsError> {
    let invalid = || JobsError::InvalidDelay {
        requested: delay_seconds,
        max: MAX_DELAY_SECONDS,
    };
    let delay = i64::try_from(delay_seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(invalid)?;
    now.checked_add_signed(delay)
        .filter(|at| at.year() <= 9999)
        .ok_or_else(invalid)
}

struct DurableSource {
    shared: Arc<Shared>,
}

#[async_trait]
impl Source for DurableSource {
    /// Job id and encoded job
    type Raw = (String, Vec<u8>);

    async fn receive(&self, wait: Duration) -> Result<Vec<Self::Raw>, JobsError> {
        let settings = self.shared.settings()?;
        let idle = settings.poll_interval.min(wait);

        let room = settings.prefetch - self.shared.counters.reserved();
        if room <= 0 {
            tokio::time::sleep(idle).await;
            return Ok(Vec::new());
        }

        let limit = usize::try_from(room).unwrap_or(BATCH).min(BATCH);
        let batch = self.shared.store()?.reserve(limit)?;
        if !batch.is_empty() {
            self.shared.counters.reserve(batch.len() as i64);
            return Ok(batch);
        }

        tokio::select! {
            _ = self.shared.ready.notified() => {}
            _ = tokio::time::sleep(idle) => {}
        }
        Ok(Vec::new())
    }

    fn accept(&self, (id, bytes): Self::Raw) -> Result<Item, Rejected<Self::Raw>> {
        match Job::decode(&bytes) {
            Ok(job) => {
                let ack = DurableAck {
                    shared: self.shared.clone(),
                    id: id.clone(),
                    job: job.clone(),
                };
                Ok(Item::new(job, Ack::new(ack)))
            }
            Err(error) => Err(Rejected {
                raw: (id, bytes),
                error,
            }),
        }
    }

    async fn discard(&self, (id, _): Self::Raw) {
        self.shared.counters.add_reserved(-1);
        let removed = self.shared.store().and_then(|store| store.remove_reserved(&id));
        if let Err(e) = removed {
            error!(job_id = %id, error = %e, "failed to discard malformed job");
        }
    }
}

/// Settles one reservation. The store entry is keyed by `id`, which is the
/// id the job was stored under.
struct DurableAck {
    shared: Arc<Shared>,
    id: String,
    job: Job,
}

#[async_trait]
impl Acknowledger for DurableAck {
    async fn ack(&self) -> Result<(), JobsError> {
        self.shared.store()?.remove_reserved(&self.id)?;
        self.shared.counters.add_reserved(-1);
        Ok(())
    }

    async fn nack(&self, requeue: bool, delay_seconds: u64) -> Result<(), JobsError> {
        if requeue {
            return self.shared.requeue(&self.id, &self.job.retried(delay_seconds));
        }

        self.shared.store()?.remove_reserved(&self.id)?;
        self.shared.counters.add_reserved(-1);
        error!(
            job_id = %self.job.id,
            pipeline = %self.job.pipeline(),
            attempt = self.job.attempt,
            "job failed and was dropped, durable driver has no dead-letter queue"
        );
        Ok(())
    }

    async fn requeue(&self) -> Result<(), JobsError> {
        let mut job = self.job.clone();
        job.options.delay_seconds = 0;
        self.shared.requeue(&self.id, &job)
    }
}

async fn promote(shared: Arc<Shared>, pipeline: String, interval: Duration, cancel: CancellationToken) {
    debug!(driver = DRIVER, pipeline = %pipeline, "promoter started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match shared.store().and_then(|store| store.promote_due(Utc::now())) {
            Ok(0) => {}
            Ok(promoted) => {
                shared.counters.promote(promoted as i64);
                shared.ready.notify_one();
                debug!(driver = DRIVER, pipeline = %pipeline, promoted, "delayed jobs promoted");
            }
            Err(e) => warn!(driver = DRIVER, pipeline = %pipeline, error = %e, "promotion failed"),
        }
    }
    debug!(driver = DRIVER, pipeline = %pipeline, "promoter stopped");
}

/// Persistent consumer bound to one pipeline
pub struct DurableDriver {
    queue: Arc<PriorityQueue>,
    dir: PathBuf,
    lifecycle: Lifecycle,
    pipeline: PipelineCell,
    /// Delivery listener, stopped on pause
    listeners: Listeners,
    /// Promoter, stopped only with the driver
    background: Listeners,
    shared: Arc<Shared>,
}

impl DurableDriver {
    pub fn new(queue: Arc<PriorityQueue>, dir: impl Into<PathBuf>) -> Self {
        Self {
            queue,
            dir: dir.into(),
            lifecycle: Lifecycle::new(DRIVER),
            pipeline: PipelineCell::new(),
            listeners: Listeners::new(),
            background: Listeners::new(),
            shared: Arc::new(Shared {
                store: RwLock::new(None),
                counters: Counters::new(),
                pool: BufferPool::default(),
                ready: Notify::new(),
                settings: OnceLock::new(),
            }),
        }
    }

    /// Open the store, run startup recovery and start the promoter
    fn open(&self, pipeline: &str) -> Result<(), JobsError> {
        let settings = self.shared.settings()?;
        let store = DelayStore::open(&settings.path, settings.permissions)?;

        let recovered = store.recover()?;
        if recovered > 0 {
            info!(
                driver = DRIVER,
                pipeline = %pipeline,
                recovered,
                "reserved jobs from a previous run moved back to push"
            );
        }

        let counts = store.counts()?;
        let counters = &self.shared.counters;
        counters.set_active(counts.push as i64);
        counters.set_delayed(counts.delay as i64);
        counters.set_reserved(0);

        *self.shared.store.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(store));

        let shared = self.shared.clone();
        let name = pipeline.to_string();
        let interval = settings.promote_interval;
        self.background
            .spawn(move |cancel| promote(shared, name, interval, cancel));
        Ok(())
    }

    fn spawn_listener(&self, pipeline: &str) -> Result<(), JobsError> {
        let settings = self.shared.settings()?;
        let source = Arc::new(DurableSource {
            shared: self.shared.clone(),
        });
        let queue = self.queue.clone();
        let config = ListenConfig::new(pipeline)
            .with_wait(settings.poll_interval)
            .with_error_backoff(settings.poll_interval);
        self.listeners
            .spawn(move |cancel| listen(source, queue, cancel, config));
        Ok(())
    }
}

#[async_trait]
impl Driver for DurableDriver {
    async fn push(&self, job: Job) -> Result<(), JobsError> {
        self.validate(&job)?;
        self.shared.insert(&job)
    }

    fn validate(&self, job: &Job) -> Result<(), JobsError> {
        job.validate_delay(self.shared.settings()?.max_delay)
    }

    async fn register(&self, pipeline: Pipeline) -> Result<(), JobsError> {
        let Some(guard) = self
            .lifecycle
            .begin(Operation::Register, &pipeline.name)
            .await?
        else {
            return Ok(());
        };

        let settings = Settings::from_pipeline(&pipeline, &self.dir)?;
        let _ = self.shared.settings.set(settings);
        self.pipeline.store(pipeline);
        guard.commit();
        Ok(())
    }

    async fn run(&self, pipeline: &Pipeline) -> Result<(), JobsError> {
        let snapshot = bound_pipeline(&self.pipeline, &pipeline.name)?;
        let name = &snapshot.pipeline.name;
        let Some(guard) = self.lifecycle.begin(Operation::Run, name).await? else {
            return Ok(());
        };

        if guard.previous() == LifecycleState::Registered {
            self.open(name)?;
        }
        self.spawn_listener(name)?;
        guard.commit();
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
            Ok(Some(guard)) => match self.spawn_listener(pipeline) {
                Ok(()) => guard.commit(),
                Err(e) => error!(driver = DRIVER, pipeline = %pipeline, error = %e, "resume failed"),
            },
            Ok(None) => {}
            Err(e) => warn!(driver = DRIVER, pipeline = %pipeline, error = %e, "resume ignored"),
        }
    }

    async fn stop(&self) -> Result<(), JobsError> {
        let name = self.pipeline.name().unwrap_or_default();
        let Some(guard) = self.lifecycle.begin(Operation::Stop, &name).await? else {
            return Ok(());
        };

        self.listeners.stop().await;
        self.background.stop().await;

        let store = self
            .shared
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(store) = store {
            info!(driver = DRIVER, pipeline = %name, path = %store.path().display(), "job store closed");
        }

        guard.commit();
        Ok(())
    }

    fn state(&self) -> State {
        let (name, priority) = self
            .pipeline
            .load()
            .map(|s| (s.pipeline.name.clone(), s.pipeline.priority))
            .unwrap_or_default();
        let queue_name = self
            .shared
            .settings
            .get()
            .map(|s| s.path.display().to_string())
            .unwrap_or_default();
        let counters = &self.shared.counters;

        State {
            pipeline: name,
            driver: DRIVER.to_string(),
            queue_name,
            priority,
            active_count: counters.active(),
            delayed_count: counters.delayed(),
            reserved_count: counters.reserved(),
            ready: self.listeners.ready(),
        }
    }
}
