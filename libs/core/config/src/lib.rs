//! Environment-driven configuration for the job broker.
//!
//! | Variable | Used by | Default |
//! |----------|---------|---------|
//! | `APP_ENV` | [`Environment`] | `development` |
//! | `RUST_LOG` | [`tracing::init_tracing`] | see [`tracing::default_directives`] |
//! | `JOBS_LOG_FORMAT` | [`tracing::LogFormat`] | `json` in production, `pretty` otherwise |
//! | `JOBS_PIPELINES` | [`broker::BrokerConfig`] | required |
//! | `JOBS_CONCURRENCY` | [`broker::BrokerConfig`] | `10` |
//! | `JOBS_DURABLE_DIR` | [`broker::BrokerConfig`] | `./data/jobs` |
//! | `JOBS_SHUTDOWN_TIMEOUT_SECS` | [`broker::BrokerConfig`] | `30` |
//! | `REDIS_HOST` | [`redis::RedisConfig`] | required when a pipeline uses the redis driver |

pub mod broker;
pub mod redis;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

impl ConfigError {
    pub(crate) fn parse(key: &str, details: impl ToString) -> Self {
        ConfigError::ParseError {
            key: key.to_string(),
            details: details.to_string(),
        }
    }
}

/// Deployment environment. Picks the default log format and filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// `APP_ENV=production` (any case) selects production, anything else
    /// development
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Configuration loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse `key` with `FromStr`, or return `default` when it is unset.
/// Surrounding whitespace is ignored.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::parse(key, e)),
        Err(_) => Ok(default),
    }
}
