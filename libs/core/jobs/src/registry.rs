//! Explicit driver registry assembled at startup.

use crate::driver::DriverFactory;
use crate::error::JobsError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Named driver factories, fixed once built.
///
/// ```rust,ignore
/// let registry = Registry::builder()
///     .driver(MemoryFactory::default())
///     .driver(RedisFactory::new(redis_config))
///     .build();
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, Arc<dyn DriverFactory>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn factory(&self, kind: &str) -> Result<Arc<dyn DriverFactory>, JobsError> {
        self.factories
            .get(kind)
            .cloned()
            .ok_or_else(|| JobsError::NoSuchDriver(kind.to_string()))
    }

    /// Registered driver names, sorted
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("drivers", &self.kinds())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    factories: BTreeMap<String, Arc<dyn DriverFactory>>,
}

impl RegistryBuilder {
    /// Add a factory. A later factory with the same kind replaces the earlier one.
    pub fn driver(mut self, factory: impl DriverFactory + 'static) -> Self {
        let kind = factory.kind().to_string();
        debug!(driver = %kind, "driver registered");
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            factories: self.factories,
        }
    }
}
