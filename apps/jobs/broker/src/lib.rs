//! Job broker service
//!
//! ```text
//! JOBS_PIPELINES ──> Broker::declare_many ──> memory / redis / durable drivers
//!                                                 ↓
//!                                           PriorityQueue
//!                                                 ↓
//!                                   Dispatcher<LogHandler> (JOBS_CONCURRENCY)
//! ```
//!
//! On SIGINT/SIGTERM the dispatcher stops popping, in-flight jobs get up to
//! `JOBS_SHUTDOWN_TIMEOUT_SECS` to finish, then every pipeline is stopped.

use core_config::broker::BrokerConfig;
use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use jobs::{
    Broker, CancellationToken, Dispatcher, DispatcherConfig, Handler, HandlerError, Job, Registry,
    async_trait,
};
use jobs_durable::DurableFactory;
use jobs_memory::MemoryFactory;
use jobs_redis::RedisFactory;
use tokio::signal;
use tracing::{debug, info, warn};

/// Logs every job it receives. Stands in for application handlers.
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        info!(
            job_id = %job.id,
            job = %job.name,
            pipeline = %job.pipeline(),
            attempt = job.attempt,
            payload_bytes = job.payload.len(),
            "job handled"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Registry with every driver this binary ships
pub fn registry(config: &BrokerConfig) -> Result<Registry> {
    let mut builder = Registry::builder()
        .driver(MemoryFactory)
        .driver(DurableFactory::new(config.durable_dir.clone()));

    builder = if config.uses_driver(jobs_redis::DRIVER) {
        let redis = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
        builder.driver(RedisFactory::new(redis.uri))
    } else {
        builder.driver(RedisFactory::default())
    };

    Ok(builder.build())
}

/// Run the broker until a shutdown signal arrives
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    info!(
        pipelines = config.pipelines.len(),
        concurrency = config.concurrency,
        durable_dir = %config.durable_dir.display(),
        "starting job broker"
    );

    let broker = Broker::new(registry(&config)?);
    broker
        .declare_many(config.pipelines.clone())
        .await
        .wrap_err("Failed to declare pipelines")?;
    for state in broker.stats_all().await {
        info!(pipeline = %state.pipeline, driver = %state.driver, queue = %state.queue_name, "pipeline active");
    }

    let dispatcher = Dispatcher::new(
        broker.queue(),
        LogHandler,
        DispatcherConfig::default().with_concurrency(config.concurrency),
    );
    let cancel = CancellationToken::new();
    let dispatching = dispatcher.run(cancel.clone());
    tokio::pin!(dispatching);

    tokio::select! {
        _ = &mut dispatching => warn!("dispatcher exited before shutdown"),
        _ = shutdown_signal() => {
            cancel.cancel();
            if tokio::time::timeout(config.shutdown_timeout, &mut dispatching).await.is_err() {
                warn!(
                    timeout_secs = config.shutdown_timeout.as_secs(),
                    "in-flight jobs did not finish in time"
                );
            }
        }
    }

    let stats = dispatcher.stats();
    info!(
        ok = stats.ok,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        settle_failed = stats.settle_failed,
        "dispatcher stopped"
    );

    match tokio::time::timeout(config.shutdown_timeout, broker.stop()).await {
        Ok(result) => result.wrap_err("Failed to stop pipelines")?,
        Err(_) => warn!("pipelines did not stop in time"),
    }
    let counters = broker.counters();
    debug!(push_ok = counters.push_ok, push_err = counters.push_err, "broker counters");

    info!("job broker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
