use crate::error::{RedisResultExt, from_redis, has_code};
use crate::settings::Settings;
use async_trait::async_trait;
use jobs::{Connector, JobsError};
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client, RedisResult};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// One dial: a connection for the blocking group reads and one for everything
/// else, so a `BLOCK` never delays a push.
#[derive(Clone)]
pub struct RedisConnection {
    pub(crate) inbound: MultiplexedConnection,
    pub(crate) outbound: MultiplexedConnection,
}

/// Where the listener reads from: this consumer's pending entries after the
/// given id, or new entries once the pending list is exhausted.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    cursor: Mutex<Option<String>>,
}

impl Replay {
    /// Start over from the beginning of the pending list
    pub(crate) fn restart(&self) {
        *self.lock() = Some("0".to_string());
    }

    pub(crate) fn cursor(&self) -> Option<String> {
        self.lock().clone()
    }

    pub(crate) fn advance(&self, last_id: &str) {
        let mut cursor = self.lock();
        if cursor.is_some() {
            *cursor = Some(last_id.to_string());
        }
    }

    pub(crate) fn finish(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RedisConnector {
    client: Client,
    settings: Arc<Settings>,
    pub(crate) replay: Arc<Replay>,
}

impl RedisConnector {
    pub fn new(settings: Arc<Settings>) -> Result<Self, JobsError> {
        let client = Client::open(settings.url.as_str())
            .map_err(|e| JobsError::config(format!("invalid redis url `{}`: {e}", settings.url)))?;
        Ok(Self {
            client,
            settings,
            replay: Arc::new(Replay::default()),
        })
    }

    /// Create the consumer group (and the stream) unless it already exists
    pub(crate) async fn ensure_group(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<(), JobsError> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.settings.stream,
                    group = %self.settings.group,
                    "created consumer group"
                );
                Ok(())
            }
            Err(e) if has_code(&e, "BUSYGROUP") => {
                debug!(
                    stream = %self.settings.stream,
                    group = %self.settings.group,
                    "consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(from_redis(&e)),
        }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<RedisConnection, JobsError> {
        let outbound = self
            .client
            .get_multiplexed_async_connection_with_config(
                &AsyncConnectionConfig::new().set_connection_timeout(Some(DIAL_TIMEOUT)),
            )
            .await
            .or_jobs()?;
        let inbound = self
            .client
            .get_multiplexed_async_connection_with_config(
                &AsyncConnectionConfig::new()
                    .set_connection_timeout(Some(DIAL_TIMEOUT))
                    .set_response_timeout(Some(self.settings.read_timeout())),
            )
            .await
            .or_jobs()?;

        self.ensure_group(&mut outbound.clone()).await?;
        debug!(stream = %self.settings.stream, consumer = %self.settings.consumer, "connected");
        Ok(RedisConnection { inbound, outbound })
    }

    async fn resubscribe(&self, connection: Arc<RedisConnection>) -> Result<(), JobsError> {
        // The server may have lost the group with a restart
        self.ensure_group(&mut connection.outbound.clone()).await?;
        self.replay.restart();
        info!(
            stream = %self.settings.stream,
            consumer = %self.settings.consumer,
            "resubscribed, replaying pending entries"
        );
        Ok(())
    }

    async fn close(&self, _connection: Arc<RedisConnection>) {
        // Multiplexed connections close once the last clone is dropped
        debug!(stream = %self.settings.stream, "connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DRIVER;
    use jobs::{ErrorKind, Pipeline};

    #[test]
    fn test_replay_cursor_moves_until_finished() {
        let replay = Replay::default();
        assert_eq!(replay.cursor(), None);

        // Advancing outside a replay changes nothing
        replay.advance("5-0");
        assert_eq!(replay.cursor(), None);

        replay.restart();
        assert_eq!(replay.cursor().as_deref(), Some("0"));
        replay.advance("1700000000000-3");
        assert_eq!(replay.cursor().as_deref(), Some("1700000000000-3"));

        replay.finish();
        assert_eq!(replay.cursor(), None);
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let pipeline = Pipeline::new("p", DRIVER);
        let settings = Settings::from_pipeline(&pipeline, "not a url").unwrap();
        let err = RedisConnector::new(Arc::new(settings)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
