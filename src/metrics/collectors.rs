//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has been called, so
//! components and tests can record unconditionally.

use crate::model::{FailureKind, PublishMode, PublishStatus, Run};
use crate::queue::QueueStats;

use super::prometheus::{
    ACTIVE_RUNS, LEASES_EXPIRED, MALFORMED_CANDIDATES, OPEN_PROPOSALS, PUBLISH_TOTAL,
    QUEUE_DEPTH, RETRIES_TOTAL, RUNS_TOTAL, RUN_DURATION, SCHEDULER_CYCLE_DURATION,
};

/// Metrics collector for recording janitor operational metrics.
///
/// # Example
///
/// ```ignore
/// use janitor::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_run(&run);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished run.
    pub fn record_run(&self, run: &Run) {
        let suite = run.key.suite.as_str();
        let outcome = run.outcome.label();

        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total.with_label_values(&[suite, outcome]).inc();
        }

        if let Some(run_duration) = RUN_DURATION.get() {
            run_duration
                .with_label_values(&[suite])
                .observe(run.duration_secs());
        }

        tracing::trace!(
            suite = suite,
            outcome = outcome,
            duration_secs = run.duration_secs(),
            "Recorded run metric"
        );
    }

    /// Record a requeue after a transient failure.
    pub fn record_retry(&self, kind: FailureKind) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[kind.as_str()]).inc();
        }
    }

    /// Record an expired lease.
    pub fn record_lease_expired(&self) {
        if let Some(expired) = LEASES_EXPIRED.get() {
            expired.inc();
        }
    }

    /// Set the number of runs holding a lease.
    pub fn set_active_runs(&self, count: usize) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.set(count as f64);
        }
    }

    /// Set the queue depth gauges from queue statistics.
    pub fn set_queue_stats(&self, stats: &QueueStats) {
        let Some(depth) = QUEUE_DEPTH.get() else {
            return;
        };

        depth.with_label_values(&["ready"]).set(stats.ready as f64);
        depth
            .with_label_values(&["deferred"])
            .set(stats.deferred as f64);
        depth.with_label_values(&["claimed"]).set(stats.claimed as f64);
        depth
            .with_label_values(&["in-progress"])
            .set(stats.in_progress as f64);
    }

    /// Record a finished scheduler cycle.
    ///
    /// # Arguments
    ///
    /// * `duration_secs` - Wall-clock duration of the cycle
    /// * `malformed` - Number of malformed candidates skipped
    pub fn record_scheduler_cycle(&self, duration_secs: f64, malformed: usize) {
        if let Some(cycle) = SCHEDULER_CYCLE_DURATION.get() {
            cycle.observe(duration_secs);
        }

        if let Some(counter) = MALFORMED_CANDIDATES.get() {
            counter.inc_by(malformed as f64);
        }
    }

    /// Record a publish decision.
    pub fn record_publish(&self, mode: Option<PublishMode>, status: PublishStatus) {
        let mode = mode.map_or("none", |m| m.as_str());
        if let Some(publish) = PUBLISH_TOTAL.get() {
            publish.with_label_values(&[mode, status.as_str()]).inc();
        }
    }

    /// Set a maintainer's open proposal count.
    pub fn set_open_proposals(&self, maintainer: &str, open: u32) {
        if let Some(gauge) = OPEN_PROPOSALS.get() {
            gauge.with_label_values(&[maintainer]).set(f64::from(open));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_is_safe_in_any_order() {
        let collector = MetricsCollector::new();
        collector.record_retry(FailureKind::InfraTransient);
        collector.set_active_runs(2);

        let _ = init_metrics();
        collector.record_publish(Some(PublishMode::Propose), PublishStatus::Published);
        collector.set_open_proposals("team@example.com", 3);
        collector.set_queue_stats(&QueueStats {
            ready: 4,
            ..Default::default()
        });

        let text = export_metrics();
        assert!(text.contains("janitor_publish_total"));
        assert!(text.contains("janitor_open_proposals"));
    }
}
