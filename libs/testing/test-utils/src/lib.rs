//! Shared test utilities for the broker and its drivers
//!
//! This crate provides reusable test infrastructure:
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic pipelines and jobs (always available)
//! - `assertions`: Priority queue helpers with timeouts (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `all`: Enables all backend test infrastructure
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::TestDataBuilder;
//!
//! #[tokio::test]
//! async fn my_driver_test() {
//!     let builder = TestDataBuilder::from_test_name("my_driver_test");
//!     let pipeline = builder.pipeline("memory", "main");
//!     let job = builder.job(&pipeline, "a");
//! }
//! ```
//!
//! ## Redis Testing
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```

use jobs::{Job, Pipeline};
use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic names and ids
///
/// Tests stay reproducible and never collide on shared backends because every
/// name is derived from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_delayed_push");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic UUID for ids that must be stable across runs
    pub fn id(&self, suffix: &str) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        for (slot, b) in uuid_bytes[8..].iter_mut().zip(suffix.bytes().cycle()) {
            *slot = b;
        }
        Uuid::from_bytes(uuid_bytes)
    }

    /// Generate a unique name for testing
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.name("pipeline", "main"), "test-pipeline-7-main");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Pipeline named after the test, bound to `driver`
    pub fn pipeline(&self, driver: &str, suffix: &str) -> Pipeline {
        Pipeline::new(self.name("pipeline", suffix), driver)
    }

    /// Job on `pipeline` whose id and name end in `suffix`
    pub fn job(&self, pipeline: &Pipeline, suffix: &str) -> Job {
        Job::new(suffix, suffix.as_bytes().to_vec())
            .with_id(self.name("job", suffix))
            .on_pipeline(pipeline.name.clone())
    }
}

/// Test assertion helpers
pub mod assertions {
    use jobs::{CancellationToken, Item, PriorityQueue};
    use std::time::Duration;

    /// Pop with a deadline, so a missing delivery fails the test instead of
    /// hanging it
    pub async fn pop_within(queue: &PriorityQueue, timeout: Duration) -> Option<Item> {
        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };
        let item = queue.pop(&cancel).await;
        deadline.abort();
        item
    }

    /// Pop or panic with `context`
    pub async fn expect_pop(queue: &PriorityQueue, timeout: Duration, context: &str) -> Item {
        pop_within(queue, timeout)
            .await
            .unwrap_or_else(|| panic!("{}: no job within {:?}", context, timeout))
    }

    /// Assert that nothing becomes ready within `window`
    pub async fn assert_empty_for(queue: &PriorityQueue, window: Duration, context: &str) {
        if let Some(item) = pop_within(queue, window).await {
            panic!("{}: unexpected job {}", context, item.job().id);
        }
    }
}
