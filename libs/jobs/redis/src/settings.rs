use jobs::{BackoffStrategy, JobsError, Pipeline, RedialConfig};
use std::time::Duration;

const DEFAULT_GROUP: &str = "jobs";
const DEFAULT_PREFETCH: u64 = 10;
const DEFAULT_BLOCK_MS: u64 = 1000;
const DEFAULT_MAX_LENGTH: u64 = 100_000;
const DEFAULT_PROMOTE_INTERVAL_MS: u64 = 500;
/// One week
const DEFAULT_MAX_DELAY: u64 = 604_800;

/// Per-pipeline Redis options, resolved once at registration
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub url: String,
    pub stream: String,
    pub group: String,
    /// Stays the same across redials so pending entries can be replayed
    pub consumer: String,
    pub delayed_key: String,
    pub dlq_stream: String,
    pub prefetch: u64,
    pub block: Duration,
    pub max_length: u64,
    pub max_delay: u64,
    pub promote_interval: Duration,
    pub redial: RedialConfig,
}

impl Settings {
    pub fn from_pipeline(pipeline: &Pipeline, default_url: &str) -> Result<Self, JobsError> {
        let name = &pipeline.name;
        let stream = match pipeline.option_str("stream", "") {
            s if s.is_empty() => format!("jobs:{name}"),
            s => s,
        };
        let consumer = match pipeline.option_str("consumer", "") {
            c if c.is_empty() => format!("broker-{}", uuid::Uuid::new_v4()),
            c => c,
        };

        let prefetch = pipeline.option_u64("prefetch", DEFAULT_PREFETCH)?;
        let block = pipeline.option_duration_ms("block_ms", DEFAULT_BLOCK_MS)?;
        let promote_interval =
            pipeline.option_duration_ms("promote_interval_ms", DEFAULT_PROMOTE_INTERVAL_MS)?;
        if prefetch == 0 || block.is_zero() || promote_interval.is_zero() {
            return Err(JobsError::config(format!(
                "pipeline `{name}`: prefetch, block_ms and promote_interval_ms must be positive"
            )));
        }

        let redial = RedialConfig {
            backoff: BackoffStrategy::Exponential {
                base: pipeline.option_duration_ms("redial_base_ms", 100)?,
                max: pipeline.option_duration_ms("redial_max_ms", 5000)?,
            },
            max_elapsed: Duration::from_secs(pipeline.option_u64("redial_max_elapsed_secs", 60)?),
        };

        Ok(Self {
            url: pipeline.option_str("url", default_url),
            delayed_key: pipeline.option_str("delayed_key", &format!("{stream}:delayed")),
            dlq_stream: pipeline.option_str("dlq_stream", &format!("{stream}:dlq")),
            group: pipeline.option_str("group", DEFAULT_GROUP),
            stream,
            consumer,
            prefetch,
            block,
            max_length: pipeline.option_u64("max_length", DEFAULT_MAX_LENGTH)?,
            max_delay: pipeline.option_u64("max_delay", DEFAULT_MAX_DELAY)?,
            promote_interval,
            redial,
        })
    }

    /// Response timeout for the blocking connection
    pub(crate) fn read_timeout(&self) -> Duration {
        self.block + Duration::from_secs(5)
    }
}
