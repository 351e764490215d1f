//! Redis Streams driver.
//!
//! Each pipeline maps to one stream read through a consumer group:
//!
//! - ready jobs are `XADD`ed to `{stream}` as a single `job` field
//! - delayed jobs wait in the sorted set `{stream}:delayed`, scored by release
//!   time in milliseconds, until a promoter script moves them to the stream
//! - acknowledged entries are `XACK`ed and deleted, so the stream length minus
//!   the group's pending count is the number of jobs not yet delivered
//! - exhausted jobs are moved to `{stream}:dlq` with the failure context
//!
//! The connection is owned by a [`jobs::Link`]: when a command fails at the
//! connection level the link redials in the background, recreates the group
//! and the listener first replays this consumer's pending entries so
//! deliveries whose ack was lost with the old connection are handed out again.

mod connector;
mod driver;
mod error;
mod settings;

pub use connector::{RedisConnection, RedisConnector};
pub use driver::{RedisDriver, RedisFactory};
pub use settings::Settings;

/// Name pipelines use to select this driver
pub const DRIVER: &str = "redis";
