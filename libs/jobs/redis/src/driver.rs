use crate::DRIVER;
use crate::connector::{RedisConnection, RedisConnector, Replay};
use crate::error::{from_redis, has_code};
use crate::settings::Settings;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use jobs::{
    Ack, Acknowledger, BufferPool, CancellationToken, Counters, Driver, DriverFactory, Item, Job,
    JobsError, Lifecycle, LifecycleState, Link, ListenConfig, Listeners, Operation, Pipeline,
    PipelineCell, PriorityQueue, Rejected, Source, State, bound_pipeline, listen,
};
use redis::{RedisResult, Script};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Delayed jobs moved per promoter run
const PROMOTE_BATCH: u64 = 100;

/// Moves due members of the delayed set (KEYS[1]) into the stream (KEYS[2]).
/// ARGV: now in ms, batch size, stream max length.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, job in ipairs(due) do
    redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*', 'job', job)
    redis.call('ZREM', KEYS[1], job)
end
return #due
"#;

/// XREADGROUP reply: stream -> entries -> fields
type StreamReply = Vec<(String, Vec<(String, Vec<(String, Vec<u8>)>)>)>;

/// XPENDING summary: count, lowest id, highest id, per-consumer counts
type PendingSummary = (i64, Option<String>, Option<String>, Option<Vec<(String, String)>>);

/// Builds Redis drivers that connect to `url` unless a pipeline sets its own
#[derive(Debug, Clone)]
pub struct RedisFactory {
    url: String,
}

impl Default for RedisFactory {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

impl RedisFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl DriverFactory for RedisFactory {
    fn kind(&self) -> &str {
        DRIVER
    }

    fn build(&self, queue: Arc<PriorityQueue>) -> Result<Arc<dyn Driver>, JobsError> {
        Ok(Arc::new(RedisDriver::new(queue, self.url.clone())))
    }
}

/// Entry ids handed to the queue and not settled yet. A pending-list replay
/// skips these, so only entries whose read reply was lost come back.
#[derive(Debug, Default)]
struct Outstanding {
    ids: Mutex<HashSet<String>>,
}

impl Outstanding {
    /// False when `id` is already out
    fn claim(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    fn settle(&self, id: &str) {
        self.lock().remove(id);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every delivery, dropping replayed ones that are already out
    fn unclaimed(&self, deliveries: Vec<Delivery>) -> Vec<Delivery> {
        deliveries
            .into_iter()
            .filter(|delivery| {
                if self.claim(&delivery.id) || !delivery.replayed {
                    return true;
                }
                debug!(entry_id = %delivery.id, "pending entry still in flight, not replayed");
                false
            })
            .collect()
    }
}

struct Shared {
    settings: OnceLock<Arc<Settings>>,
    link: OnceLock<Arc<Link<RedisConnector>>>,
    counters: Counters,
    outstanding: Outstanding,
    pool: BufferPool,
    promote: Script,
}

impl Shared {
    fn settings(&self) -> Result<&Arc<Settings>, JobsError> {
        self.settings
            .get()
            .ok_or_else(|| JobsError::NotRunning("redis consumer is not registered".into()))
    }

    fn link(&self) -> Result<&Arc<Link<RedisConnector>>, JobsError> {
        self.link
            .get()
            .ok_or_else(|| JobsError::NotRunning("redis consumer is not registered".into()))
    }

    fn replay(&self) -> Result<&Arc<Replay>, JobsError> {
        Ok(&self.link()?.connector().replay)
    }

    /// The live connection; waits while a redial is in progress
    async fn connection(&self) -> Result<Arc<RedisConnection>, JobsError> {
        self.link()?.get().await
    }

    /// Convert a command result, reporting `conn` as lost on connection errors
    fn check<T>(&self, conn: &Arc<RedisConnection>, result: RedisResult<T>) -> Result<T, JobsError> {
        result.map_err(|e| {
            let err = from_redis(&e);
            if err.is_connection() {
                if let Ok(link) = self.link() {
                    link.report_lost(conn, err.clone());
                }
            }
            err
        })
    }

    /// Run `pipe` as one MULTI/EXEC on the outbound connection
    async fn exec(&self, pipe: &redis::Pipeline) -> Result<(), JobsError> {
        let conn = self.connection().await?;
        let result = pipe.query_async::<()>(&mut conn.outbound.clone()).await;
        self.check(&conn, result)
    }

    /// Queue `job` into the stream, or the delayed set when it has a delay
    fn add_job(&self, pipe: &mut redis::Pipeline, job: &Job) -> Result<(), JobsError> {
        let settings = self.settings()?;
        let mut buf = self.pool.acquire(job.payload.len() + 256);
        job.encode_into(&mut buf)?;

        if job.is_delayed() {
            let delay_ms = i64::try_from(job.options.delay_seconds.saturating_mul(1000))
                .unwrap_or(i64::MAX);
            let release = Utc::now().timestamp_millis().saturating_add(delay_ms);
            pipe.cmd("ZADD")
                .arg(&settings.delayed_key)
                .arg(release)
                .arg(buf.as_slice())
                .ignore();
        } else {
            pipe.cmd("XADD")
                .arg(&settings.stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(settings.max_length)
                .arg("*")
                .arg("job")
                .arg(buf.as_slice())
                .ignore();
        }
        Ok(())
    }

    /// Acknowledge and delete a stream entry
    fn remove_entry(&self, pipe: &mut redis::Pipeline, entry_id: &str) -> Result<(), JobsError> {
        let settings = self.settings()?;
        pipe.cmd("XACK")
            .arg(&settings.stream)
            .arg(&settings.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&settings.stream)
            .arg(entry_id)
            .ignore();
        Ok(())
    }

    fn count_queued(&self, job: &Job) {
        if job.is_delayed() {
            self.counters.add_delayed(1);
        } else {
            self.counters.add_active(1);
        }
    }
}

/// One entry read from the stream
struct Delivery {
    id: String,
    job: Option<Vec<u8>>,
    /// Read from this consumer's pending list rather than as a new entry
    replayed: bool,
}

struct RedisSource {
    shared: Arc<Shared>,
}

impl RedisSource {
    async fn read(
        &self,
        conn: &Arc<RedisConnection>,
        cursor: Option<&str>,
        wait: Duration,
    ) -> Result<Option<StreamReply>, JobsError> {
        let settings = self.shared.settings()?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&settings.group)
            .arg(&settings.consumer)
            .arg("COUNT")
            .arg(settings.prefetch);
        if cursor.is_none() {
            let block_ms = settings.block.min(wait).as_millis().max(1) as u64;
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS")
            .arg(&settings.stream)
            .arg(cursor.unwrap_or(">"));

        let result: RedisResult<Option<StreamReply>> = cmd.query_async(&mut conn.inbound.clone()).await;
        match result {
            Err(e) if has_code(&e, "NOGROUP") => {
                warn!(stream = %settings.stream, group = %settings.group, "consumer group vanished, recreating");
                let link = self.shared.link()?;
                link.connector().ensure_group(&mut conn.outbound.clone()).await?;
                self.shared.replay()?.restart();
                Ok(None)
            }
            other => self.shared.check(conn, other),
        }
    }
}

#[async_trait]
impl Source for RedisSource {
    type Raw = Delivery;

    async fn receive(&self, wait: Duration) -> Result<Vec<Delivery>, JobsError> {
        let conn = self.shared.connection().await?;
        let replay = self.shared.replay()?;
        let cursor = replay.cursor();

        let reply = self.read(&conn, cursor.as_deref(), wait).await?;
        let deliveries: Vec<Delivery> = reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .map(|(id, fields)| Delivery {
                id,
                job: fields
                    .into_iter()
                    .find_map(|(field, value)| (field == "job").then_some(value)),
                replayed: cursor.is_some(),
            })
            .collect();

        if cursor.is_some() {
            match deliveries.last() {
                Some(last) => replay.advance(&last.id),
                None => {
                    replay.finish();
                    debug!(consumer = %self.shared.settings()?.consumer, "pending entries replayed");
                }
            }
        }
        Ok(self.shared.outstanding.unclaimed(deliveries))
    }

    fn accept(&self, delivery: Delivery) -> Result<Item, Rejected<Delivery>> {
        let decoded = match &delivery.job {
            Some(bytes) => Job::decode(bytes),
            None => Err(JobsError::Decode(format!(
                "stream entry {} has no job field",
                delivery.id
            ))),
        };

        match decoded {
            Ok(job) => {
                if delivery.replayed {
                    self.shared.counters.add_reserved(1);
                } else {
                    self.shared.counters.reserve(1);
                }
                let ack = RedisAck {
                    shared: self.shared.clone(),
                    entry_id: delivery.id,
                    job: job.clone(),
                };
                Ok(Item::new(job, Ack::new(ack)))
            }
            Err(error) => Err(Rejected {
                raw: delivery,
                error,
            }),
        }
    }

    async fn discard(&self, delivery: Delivery) {
        self.shared.outstanding.settle(&delivery.id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        let removed = match self.shared.remove_entry(&mut pipe, &delivery.id) {
            Ok(()) => self.shared.exec(&pipe).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            error!(entry_id = %delivery.id, error = %e, "failed to discard malformed entry");
        }
    }

    async fn connection_lost(&self, error: JobsError) -> bool {
        let Ok(link) = self.shared.link() else {
            return false;
        };
        warn!(error = %error, "connection lost, waiting for redial");
        match link.get().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "connection could not be restored, listener exiting");
                false
            }
        }
    }
}

struct RedisAck {
    shared: Arc<Shared>,
    entry_id: String,
    job: Job,
}

impl RedisAck {
    /// Put `job` back and remove the delivered entry in one transaction
    async fn replace(&self, job: &Job) -> Result<(), JobsError> {
        self.shared.counters.add_reserved(-1);
        self.shared.outstanding.settle(&self.entry_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.shared.add_job(&mut pipe, job)?;
        self.shared.remove_entry(&mut pipe, &self.entry_id)?;
        self.shared.exec(&pipe).await?;
        self.shared.count_queued(job);
        Ok(())
    }

    async fn dead_letter(&self) -> Result<(), JobsError> {
        self.shared.counters.add_reserved(-1);
        self.shared.outstanding.settle(&self.entry_id);
        let settings = self.shared.settings()?;
        let encoded = self.job.encode()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&settings.dlq_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(settings.max_length)
            .arg("*")
            .arg("job")
            .arg(encoded)
            .arg("attempt")
            .arg(self.job.attempt)
            .arg("entry_id")
            .arg(&self.entry_id)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            .ignore();
        self.shared.remove_entry(&mut pipe, &self.entry_id)?;
        self.shared.exec(&pipe).await?;

        error!(
            job_id = %self.job.id,
            pipeline = %self.job.pipeline(),
            attempt = self.job.attempt,
            dlq = %settings.dlq_stream,
            "job moved to dead-letter stream"
        );
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for RedisAck {
    async fn ack(&self) -> Result<(), JobsError> {
        self.shared.counters.add_reserved(-1);
        self.shared.outstanding.settle(&self.entry_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.shared.remove_entry(&mut pipe, &self.entry_id)?;
        self.shared.exec(&pipe).await
    }

    async fn nack(&self, requeue: bool, delay_seconds: u64) -> Result<(), JobsError> {
        if requeue {
            self.replace(&self.job.retried(delay_seconds)).await
        } else {
            self.dead_letter().await
        }
    }

    async fn requeue(&self) -> Result<(), JobsError> {
        let mut job = self.job.clone();
        job.options.delay_seconds = 0;
        self.replace(&job).await
    }
}

/// Promote due delayed jobs and refresh the queue counters
async fn maintain(shared: Arc<Shared>, settings: Arc<Settings>, cancel: CancellationToken) {
    debug!(driver = DRIVER, stream = %settings.stream, "promoter started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.promote_interval) => {}
        }

        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            conn = shared.connection() => conn,
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                debug!(driver = DRIVER, stream = %settings.stream, error = %e, "promoter waiting for connection");
                continue;
            }
        };

        let now = Utc::now().timestamp_millis();
        let promoted: RedisResult<u64> = shared
            .promote
            .key(&settings.delayed_key)
            .key(&settings.stream)
            .arg(now)
            .arg(PROMOTE_BATCH)
            .arg(settings.max_length)
            .invoke_async(&mut conn.outbound.clone())
            .await;
        match shared.check(&conn, promoted) {
            Ok(0) => {}
            Ok(n) => debug!(driver = DRIVER, stream = %settings.stream, promoted = n, "delayed jobs promoted"),
            Err(e) => {
                warn!(driver = DRIVER, stream = %settings.stream, error = %e, "promotion failed");
                continue;
            }
        }

        let sizes: RedisResult<(i64, PendingSummary, i64)> = redis::pipe()
            .cmd("XLEN")
            .arg(&settings.stream)
            .cmd("XPENDING")
            .arg(&settings.stream)
            .arg(&settings.group)
            .cmd("ZCARD")
            .arg(&settings.delayed_key)
            .query_async(&mut conn.outbound.clone())
            .await;
        match shared.check(&conn, sizes) {
            Ok((length, (pending, ..), delayed)) => {
                shared.counters.set_active((length - pending).max(0));
                shared.counters.set_delayed(delayed);
            }
            Err(e) => warn!(driver = DRIVER, stream = %settings.stream, error = %e, "failed to refresh counters"),
        }
    }
    debug!(driver = DRIVER, stream = %settings.stream, "promoter stopped");
}

/// Redis Streams consumer bound to one pipeline
pub struct RedisDriver {
    queue: Arc<PriorityQueue>,
    url: String,
    lifecycle: Lifecycle,
    pipeline: PipelineCell,
    /// Delivery listener, stopped on pause
    listeners: Listeners,
    /// Redial watcher and promoter, stopped only with the driver
    background: Listeners,
    shared: Arc<Shared>,
}

impl RedisDriver {
    pub fn new(queue: Arc<PriorityQueue>, url: impl Into<String>) -> Self {
        Self {
            queue,
            url: url.into(),
            lifecycle: Lifecycle::new(DRIVER),
            pipeline: PipelineCell::new(),
            listeners: Listeners::new(),
            background: Listeners::new(),
            shared: Arc::new(Shared {
                settings: OnceLock::new(),
                link: OnceLock::new(),
                counters: Counters::new(),
                outstanding: Outstanding::default(),
                pool: BufferPool::default(),
                promote: Script::new(PROMOTE_SCRIPT),
            }),
        }
    }

    /// Status of the underlying connection
    pub fn link_status(&self) -> Option<jobs::LinkStatus> {
        self.shared.link.get().map(|link| link.status())
    }

    async fn open(&self) -> Result<(), JobsError> {
        let settings = self.shared.settings()?.clone();
        let link = self.shared.link()?;

        link.connect().await?;
        if let Err(e) = link.spawn_watcher(&self.background) {
            link.shutdown().await;
            return Err(e);
        }

        let shared = self.shared.clone();
        self.background
            .spawn(move |cancel| maintain(shared, settings, cancel));
        Ok(())
    }

    /// Start the delivery listener. It first replays this consumer's pending
    /// list, which picks up entries read while a previous listener was being
    /// cancelled.
    fn spawn_listener(&self, pipeline: &str) -> Result<(), JobsError> {
        let settings = self.shared.settings()?;
        self.shared.replay()?.restart();
        let source = Arc::new(RedisSource {
            shared: self.shared.clone(),
        });
        let queue = self.queue.clone();
        let config = ListenConfig::new(pipeline)
            .with_wait(settings.block)
            .with_error_backoff(settings.block.min(Duration::from_secs(1)));
        self.listeners
            .spawn(move |cancel| listen(source, queue, cancel, config));
        Ok(())
    }
}

#[async_trait]
impl Driver for RedisDriver {
    async fn push(&self, job: Job) -> Result<(), JobsError> {
        self.validate(&job)?;
        let mut pipe = redis::pipe();
        self.shared.add_job(&mut pipe, &job)?;
        self.shared.exec(&pipe).await?;
        self.shared.count_queued(&job);
        Ok(())
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

        let settings = Arc::new(Settings::from_pipeline(&pipeline, &self.url)?);
        let connector = RedisConnector::new(settings.clone())?;
        let link = Link::new(Arc::new(connector), settings.redial.clone());
        let _ = self.shared.settings.set(settings);
        let _ = self.shared.link.set(link);

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
            self.open().await?;
            info!(
                driver = DRIVER,
                pipeline = %name,
                stream = %self.shared.settings()?.stream,
                "connected to redis"
            );
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
        // The watcher closes the link on cancel; this covers a watcher that
        // never started or already gave up
        if let Some(link) = self.shared.link.get() {
            link.shutdown().await;
        }
        self.shared.outstanding.clear();

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
            .map(|s| s.stream.clone())
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

#[cfg(test)]
mod tests {
    use super::*;
    use jobs::ErrorKind;

    #[tokio::test]
    async fn test_push_before_run_is_not_running() {
        let driver = RedisDriver::new(Arc::new(PriorityQueue::new()), DEFAULT_URL);
        let err = driver.push(Job::new("a", "")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);

        driver.register(Pipeline::new("p", DRIVER)).await.unwrap();
        let err = driver.push(Job::new("a", "").on_pipeline("p")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert_eq!(driver.state().queue_name, "jobs:p");
        assert_eq!(driver.link_status(), Some(jobs::LinkStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_delay_validated_before_connecting() {
        let driver = RedisDriver::new(Arc::new(PriorityQueue::new()), DEFAULT_URL);
        driver
            .register(Pipeline::new("p", DRIVER).with_option("max_delay", 60))
            .await
            .unwrap();

        let err = driver
            .push(Job::new("a", "").on_pipeline("p").with_delay(61))
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::InvalidDelay { requested: 61, max: 60 });
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_run() {
        let driver = RedisDriver::new(Arc::new(PriorityQueue::new()), "redis://127.0.0.1:1");
        let pipeline = Pipeline::new("p", DRIVER);
        driver.register(pipeline.clone()).await.unwrap();

        let err = driver.run(&pipeline).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(!driver.state().ready);
        driver.stop().await.unwrap();
    }

    fn delivery(id: &str, replayed: bool) -> Delivery {
        Delivery {
            id: id.to_string(),
            job: None,
            replayed,
        }
    }

    fn ids(deliveries: &[Delivery]) -> Vec<&str> {
        deliveries.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_replay_skips_entries_still_in_flight() {
        let outstanding = Outstanding::default();
        let read = outstanding.unclaimed(vec![delivery("1-0", false)]);
        assert_eq!(ids(&read), ["1-0"]);

        // After a redial the pending list holds the delivered entry and one
        // whose read reply never arrived
        let replayed = outstanding.unclaimed(vec![delivery("1-0", true), delivery("2-0", true)]);
        assert_eq!(ids(&replayed), ["2-0"]);

        // An entry whose ack failed is still pending and comes back next time
        outstanding.settle("1-0");
        let replayed = outstanding.unclaimed(vec![delivery("1-0", true), delivery("2-0", true)]);
        assert_eq!(ids(&replayed), ["1-0"]);

        outstanding.clear();
        assert!(outstanding.claim("2-0"));
    }

    #[tokio::test]
    async fn test_stop_without_run_is_clean() {
        let driver = RedisDriver::new(Arc::new(PriorityQueue::new()), DEFAULT_URL);
        driver.register(Pipeline::new("p", DRIVER)).await.unwrap();
        driver.stop().await.unwrap();
        assert_eq!(driver.link_status(), Some(jobs::LinkStatus::Closed));
    }
}
