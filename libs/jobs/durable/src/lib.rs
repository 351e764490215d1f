//! Persistent driver over an embedded single-file store.
//!
//! Every pipeline owns one database file with three tables:
//!
//! | table | key | holds |
//! |-------|-----|-------|
//! | `push` | job id | jobs ready for delivery |
//! | `in_queue` | job id | jobs handed out and not yet settled |
//! | `delay` | `{release time}\|{job id}` | jobs waiting for their release time |
//!
//! On start every `in_queue` entry moves back to `push`: whatever was in
//! flight when the process died is delivered again (at least once). A
//! promoter task moves due `delay` entries to `push`. A job id that is
//! already waiting or in flight is rejected with `DuplicateJob`.
//!
//! Pipeline options:
//!
//! | option | default |
//! |--------|---------|
//! | `path` | `{dir}/{pipeline}.db` |
//! | `permissions` | `755` (octal, unix only) |
//! | `max_delay` | [`MAX_DELAY_SECONDS`], also the upper bound |
//! | `prefetch` | `1000` |
//! | `poll_interval_ms` | `100` |
//! | `promote_interval_ms` | `1000` |

mod driver;
mod store;

pub use driver::{DurableDriver, DurableFactory, MAX_DELAY_SECONDS};
pub use store::{DelayStore, StoreCounts, release_key};

/// Name pipelines use to select this driver
pub const DRIVER: &str = "durable";
