//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by janitor and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all janitor metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished runs, labeled by suite and outcome.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Run duration in seconds, labeled by suite.
pub static RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Requeued runs, labeled by failure kind.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Queue items, labeled by state (ready, deferred, claimed, in-progress).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of runs holding a lease.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Leases reclaimed because the heartbeat or overall deadline passed.
pub static LEASES_EXPIRED: OnceLock<Counter> = OnceLock::new();

/// Scheduler cycle duration in seconds.
pub static SCHEDULER_CYCLE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Candidates skipped by the scheduler because they were malformed.
pub static MALFORMED_CANDIDATES: OnceLock<Counter> = OnceLock::new();

/// Publish decisions, labeled by mode and status.
pub static PUBLISH_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Open proposals, labeled by maintainer.
pub static OPEN_PROPOSALS: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// statics pointing at the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Run metrics
    let runs_total = CounterVec::new(
        Opts::new("janitor_runs_total", "Total number of finished runs"),
        &["suite", "outcome"],
    )?;

    let run_duration = HistogramVec::new(
        HistogramOpts::new("janitor_run_duration_seconds", "Run duration in seconds")
            .buckets(vec![10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        &["suite"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("janitor_retries_total", "Runs requeued for another attempt"),
        &["kind"],
    )?;

    // Queue and lease metrics
    let queue_depth = GaugeVec::new(
        Opts::new("janitor_queue_depth", "Number of queue items by state"),
        &["state"],
    )?;

    let active_runs = Gauge::new("janitor_active_runs", "Number of runs holding a lease")?;

    let leases_expired = Counter::new(
        "janitor_leases_expired_total",
        "Leases reclaimed after a missed deadline",
    )?;

    // Scheduler metrics
    let scheduler_cycle_duration = Histogram::with_opts(
        HistogramOpts::new(
            "janitor_scheduler_cycle_duration_seconds",
            "Scheduler cycle duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    let malformed_candidates = Counter::new(
        "janitor_malformed_candidates_total",
        "Candidates skipped because they were malformed",
    )?;

    // Publisher metrics
    let publish_total = CounterVec::new(
        Opts::new("janitor_publish_total", "Publish decisions"),
        &["mode", "status"],
    )?;

    let open_proposals = GaugeVec::new(
        Opts::new("janitor_open_proposals", "Open proposals per maintainer"),
        &["maintainer"],
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;
    registry.register(Box::new(leases_expired.clone()))?;
    registry.register(Box::new(scheduler_cycle_duration.clone()))?;
    registry.register(Box::new(malformed_candidates.clone()))?;
    registry.register(Box::new(publish_total.clone()))?;
    registry.register(Box::new(open_proposals.clone()))?;

    // A failed set means metrics were already initialized.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_RUNS.set(active_runs);
    let _ = LEASES_EXPIRED.set(leases_expired);
    let _ = SCHEDULER_CYCLE_DURATION.set(scheduler_cycle_duration);
    let _ = MALFORMED_CANDIDATES.set(malformed_candidates);
    let _ = PUBLISH_TOTAL.set(publish_total);
    let _ = OPEN_PROPOSALS.set(open_proposals);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry is not
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
