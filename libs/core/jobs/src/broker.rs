//! Control surface over all declared pipelines.
//!
//! The broker owns the shared [`PriorityQueue`], looks drivers up in the
//! [`Registry`], and routes control calls to the consumer bound to each
//! pipeline. Every method returns synchronously with a structured
//! [`JobsError`]; background failures only show up in [`State`].

use crate::ack::Item;
use crate::driver::Driver;
use crate::error::JobsError;
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::priority_queue::PriorityQueue;
use crate::registry::Registry;
use crate::state::State;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

struct Declared {
    pipeline: Arc<Pipeline>,
    driver: Arc<dyn Driver>,
}

/// Push outcome counters
#[derive(Debug, Default)]
struct Counters {
    push_ok: AtomicU64,
    push_err: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub push_ok: u64,
    pub push_err: u64,
    pub queued: usize,
}

pub struct Broker {
    registry: Registry,
    queue: Arc<PriorityQueue>,
    pipelines: RwLock<BTreeMap<String, Declared>>,
    /// Serializes declare/destroy so a name is never bound twice
    declare_lock: Mutex<()>,
    counters: Counters,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Broker {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            queue: Arc::new(PriorityQueue::new()),
            pipelines: RwLock::new(BTreeMap::new()),
            declare_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    pub fn queue(&self) -> Arc<PriorityQueue> {
        self.queue.clone()
    }

    /// Build, register and run a consumer for `pipeline`.
    #[instrument(skip(self, pipeline), fields(pipeline = %pipeline.name, driver = %pipeline.driver))]
    pub async fn declare(&self, pipeline: Pipeline) -> Result<(), JobsError> {
        let _declaring = self.declare_lock.lock().await;
        self.ensure_free(&pipeline.name).await?;

        let driver = self.build_registered(&pipeline).await?;
        if let Err(e) = driver.run(&pipeline).await {
            Self::discard(&driver, &pipeline.name).await;
            return Err(e);
        }

        self.insert(pipeline, driver).await;
        Ok(())
    }

    /// Register every pipeline first and run them only if all registrations
    /// succeeded. A pipeline that then fails to run is dropped without
    /// affecting the others; the first such error is returned.
    pub async fn declare_many(&self, pipelines: Vec<Pipeline>) -> Result<(), JobsError> {
        let _declaring = self.declare_lock.lock().await;

        let mut registered: Vec<(Pipeline, Arc<dyn Driver>)> = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let result = match self.ensure_free(&pipeline.name).await {
                Ok(()) if registered.iter().any(|(p, _)| p.name == pipeline.name) => {
                    Err(JobsError::PipelineExists(pipeline.name.clone()))
                }
                Ok(()) => self.build_registered(&pipeline).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(driver) => registered.push((pipeline, driver)),
                Err(e) => {
                    for (pipeline, driver) in &registered {
                        Self::discard(driver, &pipeline.name).await;
                    }
                    return Err(e);
                }
            }
        }

        let mut first_error = None;
        for (pipeline, driver) in registered {
            match driver.run(&pipeline).await {
                Ok(()) => self.insert(pipeline, driver).await,
                Err(e) => {
                    error!(pipeline = %pipeline.name, error = %e, "pipeline failed to start");
                    Self::discard(&driver, &pipeline.name).await;
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn ensure_free(&self, name: &str) -> Result<(), JobsError> {
        if name.is_empty() {
            return Err(JobsError::config("pipeline name must not be empty"));
        }
        if self.pipelines.read().await.contains_key(name) {
            return Err(JobsError::PipelineExists(name.to_string()));
        }
        Ok(())
    }

    async fn build_registered(&self, pipeline: &Pipeline) -> Result<Arc<dyn Driver>, JobsError> {
        let factory = self.registry.factory(&pipeline.driver)?;
        let driver = factory.build(self.queue.clone())?;
        driver.register(pipeline.clone()).await?;
        Ok(driver)
    }

    async fn discard(driver: &Arc<dyn Driver>, name: &str) {
        if let Err(e) = driver.stop().await {
            warn!(pipeline = %name, error = %e, "failed to release consumer");
        }
    }

    async fn insert(&self, pipeline: Pipeline, driver: Arc<dyn Driver>) {
        info!(pipeline = %pipeline.name, driver = %pipeline.driver, "pipeline declared");
        self.pipelines.write().await.insert(
            pipeline.name.clone(),
            Declared {
                pipeline: Arc::new(pipeline),
                driver,
            },
        );
    }

    async fn lookup(&self, name: &str) -> Result<(Arc<Pipeline>, Arc<dyn Driver>), JobsError> {
        self.pipelines
            .read()
            .await
            .get(name)
            .map(|d| (d.pipeline.clone(), d.driver.clone()))
            .ok_or_else(|| JobsError::NoSuchPipeline(name.to_string()))
    }

    /// Route a job to its pipeline's consumer
    pub async fn push(&self, job: Job) -> Result<(), JobsError> {
        let result = self.push_inner(job).await;
        match &result {
            Ok(()) => self.counters.push_ok.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.push_err.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn push_inner(&self, mut job: Job) -> Result<(), JobsError> {
        let (pipeline, driver) = self.lookup(job.pipeline()).await?;
        Self::prepare(&pipeline, &mut job);
        driver.push(job).await
    }

    /// Fill in the id and inherit the pipeline's priority
    fn prepare(pipeline: &Pipeline, job: &mut Job) {
        job.ensure_id();
        if job.options.priority == 0 {
            job.options.priority = pipeline.priority;
        }
    }

    /// Push several jobs. Every job is routed and validated by its driver
    /// before the first one is sent, so a rejected batch sends nothing.
    pub async fn push_batch(&self, jobs: Vec<Job>) -> Result<(), JobsError> {
        let total = jobs.len() as u64;
        let routed = match self.route_batch(jobs).await {
            Ok(routed) => routed,
            Err(e) => {
                self.counters.push_err.fetch_add(total, Ordering::Relaxed);
                return Err(e);
            }
        };

        for (job, driver) in routed {
            let result = driver.push(job).await;
            match &result {
                Ok(()) => self.counters.push_ok.fetch_add(1, Ordering::Relaxed),
                Err(_) => self.counters.push_err.fetch_add(1, Ordering::Relaxed),
            };
            result?;
        }
        Ok(())
    }

    async fn route_batch(&self, jobs: Vec<Job>) -> Result<Vec<(Job, Arc<dyn Driver>)>, JobsError> {
        let pipelines = self.pipelines.read().await;
        jobs.into_iter()
            .map(|mut job| -> Result<(Job, Arc<dyn Driver>), JobsError> {
                let declared = pipelines
                    .get(job.pipeline())
                    .ok_or_else(|| JobsError::NoSuchPipeline(job.pipeline().to_string()))?;
                Self::prepare(&declared.pipeline, &mut job);
                declared.driver.validate(&job)?;
                Ok((job, declared.driver.clone()))
            })
            .collect()
    }

    pub async fn pause(&self, name: &str) -> Result<(), JobsError> {
        let (_, driver) = self.lookup(name).await?;
        driver.pause(name).await;
        Ok(())
    }

    pub async fn resume(&self, name: &str) -> Result<(), JobsError> {
        let (_, driver) = self.lookup(name).await?;
        driver.resume(name).await;
        Ok(())
    }

    /// Declared pipeline names, sorted
    pub async fn list(&self) -> Vec<String> {
        self.pipelines.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self, name: &str) -> Result<State, JobsError> {
        let (_, driver) = self.lookup(name).await?;
        Ok(driver.state())
    }

    pub async fn stats_all(&self) -> Vec<State> {
        self.pipelines
            .read()
            .await
            .values()
            .map(|d| d.driver.state())
            .collect()
    }

    pub fn counters(&self) -> BrokerStats {
        BrokerStats {
            push_ok: self.counters.push_ok.load(Ordering::Relaxed),
            push_err: self.counters.push_err.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }

    /// Next job for the dispatcher, or `None` once `cancel` fires
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Item> {
        self.queue.pop(cancel).await
    }

    /// Stop a pipeline's consumer, forget the pipeline and drop its jobs
    /// still waiting in the priority queue. Dropped jobs are left to the
    /// backend's redelivery (or lost, for ephemeral backends).
    pub async fn destroy(&self, name: &str) -> Result<(), JobsError> {
        let _declaring = self.declare_lock.lock().await;
        let declared = self
            .pipelines
            .write()
            .await
            .remove(name)
            .ok_or_else(|| JobsError::NoSuchPipeline(name.to_string()))?;

        let result = declared.driver.stop().await;
        let purged = self.queue.remove_pipeline(name);
        info!(pipeline = %name, purged = purged.len(), "pipeline destroyed");
        result
    }

    /// Stop every consumer. All of them are stopped even if some fail; the
    /// first error is returned.
    pub async fn stop(&self) -> Result<(), JobsError> {
        let drivers: Vec<(String, Arc<dyn Driver>)> = self
            .pipelines
            .read()
            .await
            .iter()
            .map(|(name, d)| (name.clone(), d.driver.clone()))
            .collect();

        let mut first_error = None;
        for (name, driver) in drivers {
            if let Err(e) = driver.stop().await {
                error!(pipeline = %name, error = %e, "failed to stop pipeline");
                first_error.get_or_insert(e);
            }
        }
        info!("broker stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::{Ack, NoopAck};
    use crate::driver::{DriverFactory, Lifecycle, LifecycleState, Operation, bound_pipeline};
    use crate::pipeline::PipelineCell;
    use async_trait::async_trait;

    /// Delivers pushes straight into the queue while running
    struct DirectDriver {
        queue: Arc<PriorityQueue>,
        lifecycle: Lifecycle,
        pipeline: PipelineCell,
        fail_run: bool,
    }

    #[async_trait]
    impl Driver for DirectDriver {
        async fn push(&self, job: Job) -> Result<(), JobsError> {
            self.validate(&job)?;
            self.queue.insert(Item::new(job, Ack::new(NoopAck)));
            Ok(())
        }

        fn validate(&self, job: &Job) -> Result<(), JobsError> {
            job.validate_delay(60)
        }

        async fn register(&self, pipeline: Pipeline) -> Result<(), JobsError> {
            if let Some(guard) = self.lifecycle.begin(Operation::Register, &pipeline.name).await? {
                self.pipeline.store(pipeline);
                guard.commit();
            }
            Ok(())
        }

        async fn run(&self, pipeline: &Pipeline) -> Result<(), JobsError> {
            bound_pipeline(&self.pipeline, &pipeline.name)?;
            if self.fail_run {
                return Err(JobsError::connection("unreachable"));
            }
            if let Some(guard) = self.lifecycle.begin(Operation::Run, &pipeline.name).await? {
                guard.commit();
            }
            Ok(())
        }

        async fn pause(&self, pipeline: &str) {
            if let Ok(Some(guard)) = self.lifecycle.begin(Operation::Pause, pipeline).await {
                guard.commit();
            }
        }

        async fn resume(&self, pipeline: &str) {
            if let Ok(Some(guard)) = self.lifecycle.begin(Operation::Resume, pipeline).await {
                guard.commit();
            }
        }

        async fn stop(&self) -> Result<(), JobsError> {
            if let Some(guard) = self.lifecycle.begin(Operation::Stop, "direct").await? {
                guard.commit();
            }
            Ok(())
        }

        fn state(&self) -> State {
            let pipeline = self.pipeline.load();
            State {
                pipeline: pipeline.as_ref().map(|p| p.pipeline.name.clone()).unwrap_or_default(),
                driver: "direct".into(),
                queue_name: String::new(),
                priority: pipeline.map_or(0, |p| p.pipeline.priority),
                active_count: 0,
                delayed_count: 0,
                reserved_count: 0,
                ready: self.lifecycle.current() == LifecycleState::Running,
            }
        }
    }

    struct DirectFactory {
        kind: &'static str,
        fail_run: bool,
    }

    impl DriverFactory for DirectFactory {
        fn kind(&self) -> &str {
            self.kind
        }

        fn build(&self, queue: Arc<PriorityQueue>) -> Result<Arc<dyn Driver>, JobsError> {
            Ok(Arc::new(DirectDriver {
                queue,
                lifecycle: Lifecycle::new("direct"),
                pipeline: PipelineCell::new(),
                fail_run: self.fail_run,
            }))
        }
    }

    fn broker() -> Broker {
        Broker::new(
            Registry::builder()
                .driver(DirectFactory { kind: "direct", fail_run: false })
                .driver(DirectFactory { kind: "broken", fail_run: true })
                .build(),
        )
    }

    #[tokio::test]
    async fn test_declare_push_pop() {
        let broker = broker();
        broker
            .declare(Pipeline::new("p1", "direct").with_priority(5))
            .await
            .unwrap();

        broker.push(Job::new("a", "").on_pipeline("p1")).await.unwrap();
        let item = broker.pop(&CancellationToken::new()).await.unwrap();

        // Priority inherited from the pipeline
        assert_eq!(item.priority(), 5);
        assert_eq!(broker.counters().push_ok, 1);
        assert_eq!(broker.list().await, vec!["p1"]);
        assert!(broker.stats("p1").await.unwrap().ready);
    }

    #[tokio::test]
    async fn test_push_errors_are_structured() {
        let broker = broker();
        broker.declare(Pipeline::new("p1", "direct")).await.unwrap();

        let err = broker.push(Job::new("a", "").on_pipeline("nope")).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NoSuchPipeline);

        let err = broker
            .push(Job::new("a", "").on_pipeline("p1").with_delay(61))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidDelay);
        assert_eq!(broker.counters().push_err, 2);
    }

    #[tokio::test]
    async fn test_declare_rejects_duplicates_and_unknown_drivers() {
        let broker = broker();
        broker.declare(Pipeline::new("p1", "direct")).await.unwrap();

        assert_eq!(
            broker.declare(Pipeline::new("p1", "direct")).await,
            Err(JobsError::PipelineExists("p1".into()))
        );
        assert_eq!(
            broker.declare(Pipeline::new("p2", "kafka")).await,
            Err(JobsError::NoSuchDriver("kafka".into()))
        );
        assert!(broker.declare(Pipeline::new("", "direct")).await.is_err());
    }

    #[tokio::test]
    async fn test_declare_many_validates_before_running() {
        let broker = broker();
        let err = broker
            .declare_many(vec![
                Pipeline::new("a", "direct"),
                Pipeline::new("b", "missing"),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NoSuchDriver);
        assert!(broker.list().await.is_empty());

        // A run failure only drops the failing pipeline
        let err = broker
            .declare_many(vec![
                Pipeline::new("a", "direct"),
                Pipeline::new("b", "broken"),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Connection);
        assert_eq!(broker.list().await, vec!["a"]);

        let err = broker
            .declare_many(vec![Pipeline::new("c", "direct"), Pipeline::new("c", "direct")])
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::PipelineExists("c".into()));
    }

    #[tokio::test]
    async fn test_pause_resume_and_stats() {
        let broker = broker();
        broker.declare(Pipeline::new("p1", "direct")).await.unwrap();

        broker.pause("p1").await.unwrap();
        broker.pause("p1").await.unwrap();
        assert!(!broker.stats("p1").await.unwrap().ready);

        broker.resume("p1").await.unwrap();
        assert!(broker.stats("p1").await.unwrap().ready);
        assert!(broker.pause("p9").await.is_err());
        assert_eq!(broker.stats_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_push_batch_checks_all_pipelines_first() {
        let broker = broker();
        broker.declare(Pipeline::new("p1", "direct")).await.unwrap();

        let err = broker
            .push_batch(vec![
                Job::new("a", "").on_pipeline("p1"),
                Job::new("b", "").on_pipeline("p2"),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NoSuchPipeline);
        assert!(broker.queue().is_empty());

        broker
            .push_batch(vec![
                Job::new("a", "").on_pipeline("p1"),
                Job::new("b", "").on_pipeline("p1"),
            ])
            .await
            .unwrap();
        assert_eq!(broker.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_push_batch_validates_every_job_first() {
        let broker = broker();
        broker
            .declare(Pipeline::new("p1", "direct").with_priority(3))
            .await
            .unwrap();

        let err = broker
            .push_batch(vec![
                Job::new("ok", "").on_pipeline("p1"),
                Job::new("late", "").on_pipeline("p1").with_delay(61),
            ])
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::InvalidDelay { requested: 61, max: 60 });
        assert!(broker.queue().is_empty());
        assert_eq!(broker.counters().push_err, 2);
        assert_eq!(broker.counters().push_ok, 0);

        broker
            .push_batch(vec![Job::new("ok", "").on_pipeline("p1").with_delay(60)])
            .await
            .unwrap();
        let item = broker.pop(&CancellationToken::new()).await.unwrap();
        assert_eq!(item.priority(), 3);
        assert!(!item.job().id.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_purges_queue() {
        let broker = broker();
        broker.declare(Pipeline::new("p1", "direct")).await.unwrap();
        broker.declare(Pipeline::new("p2", "direct")).await.unwrap();
        broker.push(Job::new("a", "").on_pipeline("p1")).await.unwrap();
        broker.push(Job::new("b", "").on_pipeline("p2")).await.unwrap();

        broker.destroy("p1").await.unwrap();
        assert_eq!(broker.list().await, vec!["p2"]);
        assert_eq!(broker.queue().len(), 1);
        assert!(broker.destroy("p1").await.is_err());

        broker.stop().await.unwrap();
        assert!(!broker.stats("p2").await.unwrap().ready);
    }
}
