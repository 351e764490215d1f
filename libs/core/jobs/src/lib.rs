//! Pluggable job broker core.
//!
//! Jobs are pushed to named pipelines. Each pipeline is bound to one
//! [`Driver`] that hands jobs to a backend (in-memory channel, Redis
//! streams, an embedded durable store) and feeds deliveries back into one
//! shared [`PriorityQueue`]. Whoever pops a job settles it through the
//! [`Ack`] that came with it.
//!
//! ```text
//! Broker::push ──> Driver::push ──> backend ──> listener ──> PriorityQueue ──> Dispatcher
//!                                                  ^                              |
//!                                                  └──────── ack / nack ──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobs::{Broker, Dispatcher, DispatcherConfig, Job, Pipeline, Registry};
//!
//! let broker = Broker::new(Registry::builder().driver(MemoryFactory::default()).build());
//! broker.declare(Pipeline::new("emails", "memory")).await?;
//! broker.push(Job::new("send", payload).on_pipeline("emails")).await?;
//!
//! let dispatcher = Dispatcher::new(broker.queue(), SendEmail::new(), DispatcherConfig::default());
//! dispatcher.run(shutdown_token).await;
//! ```

pub mod ack;
pub mod broker;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod job;
pub mod listener;
pub mod pipeline;
pub mod pool;
pub mod priority_queue;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod state;

pub use ack::{Ack, Acknowledger, Item, NoopAck};
pub use broker::{Broker, BrokerStats};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, Handler};
pub use driver::{
    Driver, DriverFactory, Lifecycle, LifecycleGuard, LifecycleState, Operation, bound_pipeline,
};
pub use error::{ErrorBody, ErrorCategory, ErrorKind, HandlerError, JobsError};
pub use job::{Job, Options};
pub use listener::{ListenConfig, Listeners, Rejected, Source, listen};
pub use pipeline::{DEFAULT_PRIORITY, Pipeline, PipelineCell, PipelineSnapshot};
pub use pool::{BufferPool, PooledBuf};
pub use priority_queue::PriorityQueue;
pub use registry::{Registry, RegistryBuilder};
pub use resilience::{Connector, Link, LinkStatus, RedialConfig};
pub use retry::{BackoffStrategy, Disposition, decide};
pub use state::{Counters, State};

// Re-export for adapters implementing the traits
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
