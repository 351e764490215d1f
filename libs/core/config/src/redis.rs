use crate::{ConfigError, FromEnv, env_required};

const SCHEMES: [&str; 4] = ["redis://", "rediss://", "redis+unix://", "unix://"];

/// Server used by pipelines on the redis driver
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
}

impl RedisConfig {
    /// Accepts a full URL or a bare `host:port`, which is read as `redis://`
    pub fn new(uri: impl Into<String>) -> Result<Self, ConfigError> {
        let uri = uri.into();
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::parse("REDIS_HOST", "empty address"));
        }
        if SCHEMES.iter().any(|scheme| trimmed.starts_with(scheme)) {
            return Ok(Self {
                uri: trimmed.to_string(),
            });
        }
        if trimmed.contains("://") {
            return Err(ConfigError::parse(
                "REDIS_HOST",
                format!("unsupported scheme in `{trimmed}`"),
            ));
        }
        Ok(Self {
            uri: format!("redis://{trimmed}"),
        })
    }
}

impl FromEnv for RedisConfig {
    /// `REDIS_HOST` has no default: a redis pipeline without a server is a
    /// startup error
    fn from_env() -> Result<Self, ConfigError> {
        Self::new(env_required("REDIS_HOST")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_env() {
        temp_env::with_var("REDIS_HOST", Some("redis://localhost:6379"), || {
            assert_eq!(RedisConfig::from_env().unwrap().uri, "redis://localhost:6379");
        });
        temp_env::with_var_unset("REDIS_HOST", || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "REDIS_HOST"));
        });
    }

    #[test]
    fn test_bare_host_gets_scheme() {
        assert_eq!(
            RedisConfig::new(" cache:6380 ").unwrap().uri,
            "redis://cache:6380"
        );
        assert_eq!(
            RedisConfig::new("rediss://user:pw@prod:6379/2").unwrap().uri,
            "rediss://user:pw@prod:6379/2"
        );
    }

    #[test]
    fn test_rejects_empty_and_foreign_schemes() {
        assert!(RedisConfig::new("  ").is_err());
        let err = RedisConfig::new("http://cache:6379").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }
}
