//! janitor: schedules, runs and publishes automated source-control changes.
//!
//! The pipeline turns a set of candidates into ranked queue items
//! ([`scheduler`]), dispatches them to workers under leases with heartbeat
//! deadlines ([`runner`]), and publishes successful changes subject to
//! per-maintainer limits ([`publisher`]). All state lives behind the
//! [`storage::StateStore`] and [`queue::Queue`] traits.

pub mod api;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod storage;

pub use config::{ConfigError, JanitorConfig};
pub use publisher::PublishError;
pub use queue::QueueError;
pub use runner::{RunnerError, WorkerError};
pub use scheduler::SchedulerError;
pub use storage::StoreError;
