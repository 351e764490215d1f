//! Pipeline declarations and the versioned snapshot cell drivers bind to.

use crate::error::JobsError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub const DEFAULT_PRIORITY: i64 = 10;

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// Named configuration binding a driver and its backend options.
///
/// Options accept strings, numbers and booleans so that declarations can be
/// written naturally in JSON:
///
/// ```json
/// {"name": "emails", "driver": "redis", "priority": 5, "options": {"prefetch": 20}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub driver: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            priority: DEFAULT_PRIORITY,
            options: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// String option; numbers and booleans are rendered as text
    pub fn option_str(&self, key: &str, default: &str) -> String {
        match self.options.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => default.to_string(),
            Some(other) => other.to_string(),
        }
    }

    pub fn option_u64(&self, key: &str, default: u64) -> Result<u64, JobsError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| self.invalid(key, "unsigned integer")),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| self.invalid(key, "unsigned integer")),
            Some(_) => Err(self.invalid(key, "unsigned integer")),
        }
    }

    pub fn option_bool(&self, key: &str, default: bool) -> Result<bool, JobsError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| self.invalid(key, "boolean")),
            Some(_) => Err(self.invalid(key, "boolean")),
        }
    }

    pub fn option_duration_ms(&self, key: &str, default_ms: u64) -> Result<Duration, JobsError> {
        self.option_u64(key, default_ms).map(Duration::from_millis)
    }

    fn invalid(&self, key: &str, expected: &str) -> JobsError {
        JobsError::config(format!(
            "pipeline `{}`: option `{}` must be a {}",
            self.name, key, expected
        ))
    }
}

/// One published version of a pipeline.
#[derive(Debug)]
pub struct PipelineSnapshot {
    pub version: u64,
    pub pipeline: Pipeline,
}

/// Atomically swappable pipeline configuration.
///
/// Writers always publish a whole new [`PipelineSnapshot`]; readers hold an
/// `Arc` to the version they loaded and never observe a partial update.
#[derive(Debug, Default)]
pub struct PipelineCell {
    current: RwLock<Option<Arc<PipelineSnapshot>>>,
}

impl PipelineCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<PipelineSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish `pipeline`, returning the new version
    pub fn store(&self, pipeline: Pipeline) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let version = current.as_ref().map_or(1, |s| s.version + 1);
        *current = Some(Arc::new(PipelineSnapshot { version, pipeline }));
        version
    }

    /// Read-copy-write; `None` when nothing was published yet
    pub fn update(&self, f: impl FnOnce(&Pipeline) -> Pipeline) -> Option<u64> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = current.as_ref()?;
        let version = snapshot.version + 1;
        let pipeline = f(&snapshot.pipeline);
        *current = Some(Arc::new(PipelineSnapshot { version, pipeline }));
        Some(version)
    }

    pub fn name(&self) -> Option<String> {
        self.load().map(|s| s.pipeline.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_declaration() {
        let pipeline: Pipeline = serde_json::from_value(json!({
            "name": "emails",
            "driver": "redis",
            "options": {"prefetch": 20, "stream": "mail", "block_ms": "250"}
        }))
        .unwrap();

        assert_eq!(pipeline.priority, DEFAULT_PRIORITY);
        assert_eq!(pipeline.option_u64("prefetch", 10).unwrap(), 20);
        assert_eq!(pipeline.option_u64("block_ms", 1000).unwrap(), 250);
        assert_eq!(pipeline.option_str("stream", "x"), "mail");
        assert_eq!(pipeline.option_str("group", "jobs"), "jobs");
    }

    #[test]
    fn test_malformed_option_is_config_error() {
        let pipeline = Pipeline::new("p", "memory").with_option("prefetch", "lots");
        let err = pipeline.option_u64("prefetch", 1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
        assert!(err.to_string().contains("prefetch"));

        let pipeline = Pipeline::new("p", "memory").with_option("sync", 3);
        assert!(pipeline.option_bool("sync", false).is_err());
    }

    #[test]
    fn test_cell_versions() {
        let cell = PipelineCell::new();
        assert!(cell.load().is_none());
        assert_eq!(cell.update(|p| p.clone()), None);

        assert_eq!(cell.store(Pipeline::new("p", "memory")), 1);
        let before = cell.load().unwrap();

        let version = cell.update(|p| p.clone().with_priority(99)).unwrap();
        assert_eq!(version, 2);

        // The reader that loaded version 1 keeps seeing it unchanged
        assert_eq!(before.version, 1);
        assert_eq!(before.pipeline.priority, DEFAULT_PRIORITY);
        assert_eq!(cell.load().unwrap().pipeline.priority, 99);
        assert_eq!(cell.name().as_deref(), Some("p"));
    }
}
