use crate::{ConfigError, Environment};
use std::str::FromStr;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Crates whose events the broker logs at `debug` in development
const BROKER_CRATES: [&str; 5] = ["jobs", "jobs_memory", "jobs_redis", "jobs_durable", "jobs_broker"];

/// Install color-eyre for the broker binary. Location sections are shown,
/// environment sections are not (pipeline JSON would flood them).
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Output format of the subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One flattened JSON object per event, for log shipping
    Json,
    Pretty,
    /// Single-line human output, handy when tailing a busy broker
    Compact,
}

impl LogFormat {
    /// `JOBS_LOG_FORMAT` if set and valid, otherwise JSON in production and
    /// pretty output elsewhere
    pub fn from_env(environment: &Environment) -> Result<Self, ConfigError> {
        match std::env::var("JOBS_LOG_FORMAT") {
            Ok(raw) => raw.parse(),
            Err(_) if environment.is_production() => Ok(LogFormat::Json),
            Err(_) => Ok(LogFormat::Pretty),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ConfigError::ParseError {
                key: "JOBS_LOG_FORMAT".to_string(),
                details: format!("unknown format `{other}`, expected json, pretty or compact"),
            }),
        }
    }
}

/// Filter used when `RUST_LOG` is unset.
///
/// Production logs `info` everywhere. Development keeps dependencies at
/// `info` and raises the broker crates to `debug`, so redial attempts and
/// per-job events show up without the redis client's chatter.
pub fn default_directives(environment: &Environment) -> String {
    if environment.is_production() {
        return "info".to_string();
    }
    let mut directives = String::from("info");
    for krate in BROKER_CRATES {
        directives.push(',');
        directives.push_str(krate);
        directives.push_str("=debug");
    }
    directives
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` overrides [`default_directives`]. The `tracing_error::ErrorLayer`
/// lets `color-eyre` reports carry the span trace of a failed declare or
/// push. An invalid `JOBS_LOG_FORMAT` falls back to the environment default
/// with a warning, since logging is not up yet to report it any other way.
///
/// Calling this more than once is a no-op.
pub fn init_tracing(environment: &Environment) {
    let (format, format_error) = match LogFormat::from_env(environment) {
        Ok(format) => (format, None),
        Err(e) if environment.is_production() => (LogFormat::Json, Some(e)),
        Err(e) => (LogFormat::Pretty, Some(e)),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)));

    let registry = tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init(),
    };

    match result {
        Ok(()) => {
            info!(environment = ?environment, format = ?format, "tracing initialized");
            if let Some(e) = format_error {
                tracing::warn!(error = %e, "ignoring JOBS_LOG_FORMAT");
            }
        }
        // Common in tests
        Err(_) => debug!("tracing already initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_defaults_follow_environment() {
        temp_env::with_var_unset("JOBS_LOG_FORMAT", || {
            assert_eq!(
                LogFormat::from_env(&Environment::Production).unwrap(),
                LogFormat::Json
            );
            assert_eq!(
                LogFormat::from_env(&Environment::Development).unwrap(),
                LogFormat::Pretty
            );
        });
    }

    #[test]
    fn test_log_format_override() {
        temp_env::with_var("JOBS_LOG_FORMAT", Some(" Compact "), || {
            assert_eq!(
                LogFormat::from_env(&Environment::Production).unwrap(),
                LogFormat::Compact
            );
        });

        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "JOBS_LOG_FORMAT"));
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(&Environment::Production), "info");

        let dev = default_directives(&Environment::Development);
        assert!(dev.starts_with("info,"));
        assert!(dev.contains("jobs_redis=debug"));
        assert!(dev.contains("jobs_broker=debug"));
        // Every directive must parse
        assert!(EnvFilter::try_new(&dev).is_ok());
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        temp_env::with_vars(
            [("JOBS_LOG_FORMAT", Some("bogus")), ("RUST_LOG", Some("warn"))],
            || {
                init_tracing(&Environment::Development);
                init_tracing(&Environment::Production);
            },
        );
    }
}
