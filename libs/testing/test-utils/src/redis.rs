//! Disposable Redis server for driver tests.
//!
//! Besides the container, [`TestRedis`] has the helpers the broker tests
//! assert with (stream length, pending entries of a group, delayed set size)
//! and a way to cut every client off to simulate an outage.

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

const IMAGE_TAG: &str = "8-alpine";

/// Redis container that lives as long as this value.
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let url = redis.connection_string();
/// // Hand `url` to the driver under test, then inspect the stream
/// assert_eq!(redis.stream_len("jobs:emails").await, 0);
/// # }
/// ```
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    url: String,
}

impl TestRedis {
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag(IMAGE_TAG)
            .start()
            .await
            .expect("Failed to start Redis container");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");
        let url = format!("redis://127.0.0.1:{port}");

        let connection = Client::open(url.as_str())
            .expect("Failed to create Redis client")
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port, tag = IMAGE_TAG, "test redis ready");
        Self {
            _container: container,
            connection,
            url,
        }
    }

    /// Connection owned by the test, spared by [`Self::kill_clients`]
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.url
    }

    /// Entries still in `stream`. Settled jobs are deleted, so this counts
    /// queued plus in-flight jobs.
    pub async fn stream_len(&self, stream: &str) -> usize {
        self.connection()
            .xlen(stream)
            .await
            .expect("XLEN failed")
    }

    /// Entries delivered to `group` and not yet acknowledged. Zero when the
    /// group does not exist yet.
    pub async fn pending(&self, stream: &str, group: &str) -> usize {
        let summary: redis::RedisResult<(usize, Option<String>, Option<String>, redis::Value)> =
            redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .query_async(&mut self.connection())
                .await;
        match summary {
            Ok((count, ..)) => count,
            Err(e) if e.code() == Some("NOGROUP") => 0,
            Err(e) => panic!("XPENDING failed: {e}"),
        }
    }

    /// Jobs waiting in a delayed sorted set
    pub async fn delayed(&self, key: &str) -> usize {
        self.connection().zcard(key).await.expect("ZCARD failed")
    }

    /// Drop every client connection except the test's own, simulating a network
    /// outage for the code under test. Returns how many were killed.
    pub async fn kill_clients(&self) -> u64 {
        redis::cmd("CLIENT")
            .arg("KILL")
            .arg("TYPE")
            .arg("normal")
            .arg("SKIPME")
            .arg("yes")
            .query_async(&mut self.connection())
            .await
            .expect("Failed to kill Redis clients")
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!(url = %self.url, "removing test redis container");
    }
}
