//! In-process ephemeral driver.
//!
//! Jobs live in an unbounded channel owned by the driver and are lost when
//! the process exits. Delayed jobs wait in timer tasks and enter the channel
//! when due. Failed jobs cannot be dead-lettered; they are dropped with an
//! error log.
//!
//! Pipeline options:
//!
//! | option | default |
//! |--------|---------|
//! | `max_delay` | `0` (unbounded) |
//! | `prefetch` | `100000` |

mod driver;

pub use driver::{MemoryDriver, MemoryFactory};

/// Name pipelines use to select this driver
pub const DRIVER: &str = "memory";
