//! Metrics module for Prometheus-based monitoring.
//!
//! Metrics cover the whole pipeline: runs and retries, queue depth and
//! leases, scheduler cycles, and publish decisions.
//!
//! # Example
//!
//! ```ignore
//! use janitor::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_scheduler_cycle(0.2, 0);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_RUNS, LEASES_EXPIRED, MALFORMED_CANDIDATES, OPEN_PROPOSALS, PUBLISH_TOTAL,
    QUEUE_DEPTH, REGISTRY, RETRIES_TOTAL, RUNS_TOTAL, RUN_DURATION, SCHEDULER_CYCLE_DURATION,
};
