use crate::{ConfigError, FromEnv, env_or_default, env_parse, env_required};
use jobs::Pipeline;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Broker process configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Pipelines declared at startup
    pub pipelines: Vec<Pipeline>,
    /// Jobs executed at the same time
    pub concurrency: usize,
    /// Default directory for durable pipeline files
    pub durable_dir: PathBuf,
    /// Upper bound on draining in-flight jobs at shutdown
    pub shutdown_timeout: Duration,
}

impl BrokerConfig {
    /// Whether any declared pipeline uses `driver`
    pub fn uses_driver(&self, driver: &str) -> bool {
        self.pipelines.iter().any(|p| p.driver == driver)
    }
}

impl FromEnv for BrokerConfig {
    /// `JOBS_PIPELINES` is required and holds a JSON array of pipelines:
    ///
    /// ```json
    /// [{"name": "emails", "driver": "redis", "priority": 5, "options": {"prefetch": 20}}]
    /// ```
    fn from_env() -> Result<Self, ConfigError> {
        let raw = env_required("JOBS_PIPELINES")?;
        let pipelines: Vec<Pipeline> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::parse("JOBS_PIPELINES", e))?;
        let mut names = BTreeSet::new();
        for pipeline in &pipelines {
            if pipeline.name.trim().is_empty() {
                return Err(ConfigError::parse("JOBS_PIPELINES", "pipeline name is empty"));
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(ConfigError::parse(
                    "JOBS_PIPELINES",
                    format!("pipeline `{}` is declared twice", pipeline.name),
                ));
            }
        }

        let concurrency = env_parse("JOBS_CONCURRENCY", 10usize)?;
        if concurrency == 0 {
            return Err(ConfigError::parse("JOBS_CONCURRENCY", "must be at least 1"));
        }

        Ok(Self {
            pipelines,
            concurrency,
            durable_dir: PathBuf::from(env_or_default("JOBS_DURABLE_DIR", "./data/jobs")),
            shutdown_timeout: Duration::from_secs(env_parse("JOBS_SHUTDOWN_TIMEOUT_SECS", 30)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINES: &str = r#"[
        {"name": "emails", "driver": "redis", "priority": 5, "options": {"prefetch": 20}},
        {"name": "local", "driver": "memory"}
    ]"#;

    #[test]
    fn test_broker_config_defaults() {
        temp_env::with_vars(
            [
                ("JOBS_PIPELINES", Some(PIPELINES)),
                ("JOBS_CONCURRENCY", None),
                ("JOBS_DURABLE_DIR", None),
                ("JOBS_SHUTDOWN_TIMEOUT_SECS", None),
            ],
            || {
                let config = BrokerConfig::from_env().unwrap();
                assert_eq!(config.pipelines.len(), 2);
                assert_eq!(config.pipelines[0].priority, 5);
                assert_eq!(config.pipelines[1].priority, jobs::DEFAULT_PRIORITY);
                assert_eq!(config.concurrency, 10);
                assert_eq!(config.durable_dir, PathBuf::from("./data/jobs"));
                assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
                assert!(config.uses_driver("redis"));
                assert!(!config.uses_driver("durable"));
            },
        );
    }

    #[test]
    fn test_broker_config_overrides() {
        temp_env::with_vars(
            [
                ("JOBS_PIPELINES", Some("[]")),
                ("JOBS_CONCURRENCY", Some("4")),
                ("JOBS_DURABLE_DIR", Some("/var/lib/jobs")),
                ("JOBS_SHUTDOWN_TIMEOUT_SECS", Some("5")),
            ],
            || {
                let config = BrokerConfig::from_env().unwrap();
                assert!(config.pipelines.is_empty());
                assert_eq!(config.concurrency, 4);
                assert_eq!(config.durable_dir, PathBuf::from("/var/lib/jobs"));
                assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_broker_config_requires_pipelines() {
        temp_env::with_var_unset("JOBS_PIPELINES", || {
            let err = BrokerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "JOBS_PIPELINES"));
        });
    }

    #[test]
    fn test_broker_config_rejects_bad_values() {
        temp_env::with_var("JOBS_PIPELINES", Some("{not json"), || {
            let err = BrokerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "JOBS_PIPELINES"));
        });

        let twice = r#"[{"name": "a", "driver": "memory"}, {"name": "a", "driver": "redis"}]"#;
        temp_env::with_var("JOBS_PIPELINES", Some(twice), || {
            let err = BrokerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("declared twice"));
        });

        temp_env::with_vars(
            [("JOBS_PIPELINES", Some("[]")), ("JOBS_CONCURRENCY", Some("0"))],
            || {
                let err = BrokerConfig::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "JOBS_CONCURRENCY"));
            },
        );
    }
}
