//! Connection resilience for network-backed adapters.
//!
//! A [`Link`] owns the adapter's connection handle and a watcher task. When a
//! user of the connection reports it lost, the watcher:
//!
//! 1. withdraws the broken handle, so `get()` callers wait instead of using it
//! 2. redials with exponential backoff bounded by a maximum elapsed time
//! 3. lets the adapter resubscribe on the new connection (same consumer id)
//! 4. publishes the new handle, which releases the waiting callers
//!
//! If the backoff runs out the link is marked failed and stays failed: waiting
//! callers get an error and nothing respawns. An explicit stop closes the
//! connection without going through the redial path.
//!
//! Only the handle swap is serialized. Dialing happens outside of any lock
//! that `push` or `state()` would contend on.

use crate::error::JobsError;
use crate::listener::Listeners;
use crate::retry::BackoffStrategy;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backend-specific connection setup.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Dial, redeclare topology idempotently, and open the inbound and
    /// outbound channels.
    async fn connect(&self) -> Result<Self::Connection, JobsError>;

    /// Restart subscriptions on a rebuilt connection
    async fn resubscribe(&self, connection: Arc<Self::Connection>) -> Result<(), JobsError>;

    /// Close the connection on an explicit stop
    async fn close(&self, connection: Arc<Self::Connection>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedialConfig {
    pub backoff: BackoffStrategy,
    /// Give up once redialing has taken this long
    pub max_elapsed: Duration,
}

impl Default for RedialConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(5),
            },
            max_elapsed: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum LinkStatus {
    Disconnected,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

enum LinkState<C> {
    Disconnected,
    Connected(Arc<C>),
    Reconnecting,
    Failed(String),
    Closed,
}

impl<C> LinkState<C> {
    fn status(&self) -> LinkStatus {
        match self {
            LinkState::Disconnected => LinkStatus::Disconnected,
            LinkState::Connected(_) => LinkStatus::Connected,
            LinkState::Reconnecting => LinkStatus::Reconnecting,
            LinkState::Failed(_) => LinkStatus::Failed,
            LinkState::Closed => LinkStatus::Closed,
        }
    }
}

/// Resilient connection slot shared by `push`, listeners and the watcher.
pub struct Link<C: Connector> {
    connector: Arc<C>,
    config: RedialConfig,
    state: watch::Sender<LinkState<C::Connection>>,
    lost_tx: mpsc::UnboundedSender<JobsError>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<JobsError>>>,
}

impl<C: Connector> fmt::Debug for Link<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

impl<C: Connector> Link<C> {
    pub fn new(connector: Arc<C>, config: RedialConfig) -> Arc<Self> {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connector,
            config,
            state,
            lost_tx,
            lost_rx: Mutex::new(Some(lost_rx)),
        })
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    pub fn status(&self) -> LinkStatus {
        self.state.borrow().status()
    }

    /// Initial dial. A failure here is reported to the caller of `run`
    /// instead of being retried.
    pub async fn connect(&self) -> Result<Arc<C::Connection>, JobsError> {
        let connection = Arc::new(self.connector.connect().await?);
        self.state
            .send_replace(LinkState::Connected(connection.clone()));
        Ok(connection)
    }

    /// The live connection, without waiting
    pub fn current(&self) -> Option<Arc<C::Connection>> {
        match &*self.state.borrow() {
            LinkState::Connected(connection) => Some(connection.clone()),
            _ => None,
        }
    }

    /// The live connection. Waits while a redial is in progress and fails
    /// once the link is failed or closed.
    pub async fn get(&self) -> Result<Arc<C::Connection>, JobsError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, LinkState::Reconnecting))
            .await
            .map_err(|_| JobsError::Closed)?;

        match &*state {
            LinkState::Connected(connection) => Ok(connection.clone()),
            LinkState::Failed(reason) => Err(JobsError::connection(format!(
                "connection could not be restored: {reason}"
            ))),
            LinkState::Closed => Err(JobsError::NotRunning("connection closed".into())),
            LinkState::Disconnected | LinkState::Reconnecting => {
                Err(JobsError::NotRunning("not connected".into()))
            }
        }
    }

    /// Report that `connection` is broken. Reports about a connection that
    /// was already replaced are ignored, so one outage triggers one redial.
    pub fn report_lost(&self, connection: &Arc<C::Connection>, cause: JobsError) {
        let withdrawn = self.state.send_if_modified(|state| match state {
            LinkState::Connected(current) if Arc::ptr_eq(current, connection) => {
                // Drop the broken handle right away
                *state = LinkState::Reconnecting;
                true
            }
            _ => false,
        });

        if withdrawn {
            let _ = self.lost_tx.send(cause);
        }
    }

    /// Start the watcher in `tasks`. It exits when `tasks` is stopped or the
    /// redial gives up.
    pub fn spawn_watcher(self: &Arc<Self>, tasks: &Listeners) -> Result<(), JobsError> {
        let lost_rx = self
            .lost_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| JobsError::Internal("watcher already started".into()))?;

        let link = self.clone();
        tasks.spawn(move |cancel| async move { link.watch(lost_rx, cancel).await });
        Ok(())
    }

    async fn watch(&self, mut lost_rx: mpsc::UnboundedReceiver<JobsError>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close().await;
                    return;
                }
                cause = lost_rx.recv() => {
                    let Some(cause) = cause else { return };
                    if !self.redial(cause, &cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns `false` when the watcher should exit
    async fn redial(&self, cause: JobsError, cancel: &CancellationToken) -> bool {
        warn!(error = %cause, "connection lost, redialing");

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let delay = self.config.backoff.delay(attempt);
            if started.elapsed() + delay > self.config.max_elapsed {
                let reason = format!("gave up after {attempt} attempts: {cause}");
                error!(
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "redial exhausted, pipeline stays down"
                );
                self.state.send_replace(LinkState::Failed(reason));
                return false;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close().await;
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;

            let connection = match self.connector.connect().await {
                Ok(connection) => Arc::new(connection),
                Err(e) => {
                    warn!(attempt, error = %e, "redial attempt failed");
                    continue;
                }
            };

            if let Err(e) = self.connector.resubscribe(connection.clone()).await {
                warn!(attempt, error = %e, "resubscribe failed after redial");
                continue;
            }

            self.state.send_replace(LinkState::Connected(connection));
            info!(
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "connection restored"
            );
            return true;
        }
    }

    async fn close(&self) {
        let previous = self.state.send_replace(LinkState::Closed);
        if let LinkState::Connected(connection) = previous {
            self.connector.close(connection).await;
        }
        info!("connection closed");
    }

    /// Close without a watcher, e.g. when `run` fails halfway
    pub async fn shutdown(&self) {
        if self.status() != LinkStatus::Closed {
            self.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeConnector {
        failures_left: AtomicUsize,
        always_fail: AtomicBool,
        connects: AtomicUsize,
        resubscribed: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Connection = usize;

        async fn connect(&self) -> Result<usize, JobsError> {
            if self.always_fail.load(Ordering::SeqCst) {
                return Err(JobsError::connection("refused"));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(JobsError::connection("refused"));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn resubscribe(&self, _connection: Arc<usize>) -> Result<(), JobsError> {
            self.resubscribed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self, _connection: Arc<usize>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_elapsed: Duration) -> RedialConfig {
        RedialConfig {
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
            max_elapsed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_redial_restores_connection_and_resubscribes() {
        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(connector.clone(), config(Duration::from_secs(30)));
        let tasks = Listeners::new();

        let first = link.connect().await.unwrap();
        assert_eq!(*first, 1);
        link.spawn_watcher(&tasks).unwrap();

        connector.failures_left.store(2, Ordering::SeqCst);
        link.report_lost(&first, JobsError::connection("reset"));
        assert_eq!(link.status(), LinkStatus::Reconnecting);
        assert!(link.current().is_none());

        // Blocks through the outage, then sees the new connection
        let restored = link.get().await.unwrap();
        assert_eq!(*restored, 2);
        assert_eq!(connector.resubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(link.status(), LinkStatus::Connected);

        tasks.stop().await;
        assert_eq!(link.status(), LinkStatus::Closed);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_loss_report_is_ignored() {
        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(connector.clone(), config(Duration::from_secs(30)));
        let tasks = Listeners::new();

        let first = link.connect().await.unwrap();
        link.spawn_watcher(&tasks).unwrap();

        link.report_lost(&first, JobsError::connection("reset"));
        let second = link.get().await.unwrap();

        // A late report about the old connection does not start another redial
        link.report_lost(&first, JobsError::connection("reset"));
        assert_eq!(link.status(), LinkStatus::Connected);
        assert!(Arc::ptr_eq(&link.current().unwrap(), &second));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        tasks.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_redial_fails_explicitly() {
        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(connector.clone(), config(Duration::from_secs(2)));
        let tasks = Listeners::new();

        let first = link.connect().await.unwrap();
        link.spawn_watcher(&tasks).unwrap();

        connector.always_fail.store(true, Ordering::SeqCst);
        link.report_lost(&first, JobsError::connection("reset"));

        let err = link.get().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Connection);
        assert_eq!(link.status(), LinkStatus::Failed);
        assert_eq!(connector.resubscribed.load(Ordering::SeqCst), 0);

        // The watcher exited; nothing is running anymore
        tasks.stop().await;
        assert_eq!(link.status(), LinkStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_redial_closes() {
        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(connector.clone(), config(Duration::from_secs(600)));
        let tasks = Listeners::new();

        let first = link.connect().await.unwrap();
        link.spawn_watcher(&tasks).unwrap();

        connector.always_fail.store(true, Ordering::SeqCst);
        link.report_lost(&first, JobsError::connection("reset"));
        tokio::time::sleep(Duration::from_secs(3)).await;

        tasks.stop().await;
        assert_eq!(link.status(), LinkStatus::Closed);
        assert!(link.get().await.is_err());
    }

    #[tokio::test]
    async fn test_watcher_starts_once() {
        let link = Link::new(Arc::new(FakeConnector::default()), RedialConfig::default());
        let tasks = Listeners::new();
        link.spawn_watcher(&tasks).unwrap();
        assert!(link.spawn_watcher(&tasks).is_err());
        tasks.stop().await;
    }
}
