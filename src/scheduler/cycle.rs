//! The periodic scheduler cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::model::{AuditEvent, AuditKind, RunKey};
use crate::metrics::MetricsCollector;
use crate::queue::{Queue, QueueError, QueueItem, MANUAL_PRIORITY};
use crate::storage::{StateStore, StoreError};

use super::ranking::Ranker;

/// Errors that abort a scheduler cycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Reading candidates or state failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Writing the queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A manual request named an unusable target.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    /// Candidates considered.
    pub candidates: usize,
    /// Items inserted or updated in the queue.
    pub admitted: usize,
    /// Queued items evicted because they dropped out of the schedule.
    pub evicted: usize,
    pub malformed: usize,
    pub in_flight: usize,
    pub blocked: usize,
    pub overflow: usize,
}

/// Converts the candidate set into queue contents, periodically.
pub struct Scheduler {
    ranker: Ranker,
    interval: Duration,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    metrics: MetricsCollector,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(
        ranker: Ranker,
        interval: Duration,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        Self {
            ranker,
            interval,
            store,
            queue,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs a single cycle.
    ///
    /// Malformed candidates are reported through the audit log and never
    /// fail the cycle. Storage and queue failures do.
    pub async fn run_once(&self) -> Result<CycleReport, SchedulerError> {
        let started = Instant::now();
        let now = Utc::now();

        let candidates = self.store.list_candidates().await?;
        let policies = self.store.list_policies().await?;
        let targets = self.store.list_target_states().await?;
        let current = self.queue.list().await?;

        let schedule = self
            .ranker
            .schedule(&candidates, &current, &policies, &targets, now);

        for malformed in &schedule.malformed {
            warn!(
                index = malformed.index,
                target = ?malformed.target,
                reason = %malformed.reason,
                "Skipping malformed candidate"
            );
            let event = AuditEvent::new(
                AuditKind::MalformedCandidate,
                format!("candidate #{}: {}", malformed.index, malformed.reason),
            );
            self.store.append_event(&event).await?;
        }

        let known: HashSet<&RunKey> = current.iter().map(|i| &i.key).collect();
        let fresh: Vec<RunKey> = schedule
            .items
            .iter()
            .filter(|i| !known.contains(&i.key))
            .map(|i| i.key.clone())
            .collect();

        let mut keep: HashSet<RunKey> = schedule.items.iter().map(|i| i.key.clone()).collect();
        keep.extend(schedule.pinned.iter().cloned());

        let admitted = self.queue.push(schedule.items).await?;
        let evicted = self.queue.retain_pending(&keep).await?;

        for key in fresh {
            debug!(key = %key, "Admitted candidate");
            let event = AuditEvent::new(AuditKind::Queued, "admitted by scheduler").with_key(key);
            self.store.append_event(&event).await?;
        }

        let report = CycleReport {
            candidates: candidates.len(),
            admitted,
            evicted,
            malformed: schedule.malformed.len(),
            in_flight: schedule.in_flight,
            blocked: schedule.blocked,
            overflow: schedule.overflow,
        };

        self.metrics
            .record_scheduler_cycle(started.elapsed().as_secs_f64(), report.malformed);
        self.metrics
            .set_queue_stats(&self.queue.stats(Utc::now()).await?);

        info!(
            candidates = report.candidates,
            admitted = report.admitted,
            evicted = report.evicted,
            malformed = report.malformed,
            blocked = report.blocked,
            overflow = report.overflow,
            "Scheduler cycle complete"
        );

        Ok(report)
    }

    /// Enqueues an operator request at top priority.
    ///
    /// The item is pinned: later cycles neither evict nor reprioritize it.
    /// Returns `None` if the key is already claimed or running.
    pub async fn reschedule(
        &self,
        key: RunKey,
        maintainer: Option<String>,
        context: serde_json::Value,
        requestor: &str,
    ) -> Result<Option<QueueItem>, SchedulerError> {
        if key.target.trim().is_empty() || key.suite.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "target and suite are required".to_string(),
            ));
        }

        let state = self.store.get_target_state(&key).await?;
        let maintainer = maintainer
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| key.target.clone());
        let item = QueueItem::new(key.clone(), maintainer, context, MANUAL_PRIORITY)
            .with_estimated_duration(state.and_then(|s| s.last_duration_secs))
            .with_requestor(requestor);

        if self.queue.push(vec![item]).await? == 0 {
            info!(key = %key, "Reschedule ignored, run already in flight");
            return Ok(None);
        }

        let event = AuditEvent::new(AuditKind::Queued, format!("rescheduled by {}", requestor))
            .with_key(key.clone());
        self.store.append_event(&event).await?;
        info!(key = %key, requestor = requestor, "Rescheduled");

        let queued = self
            .queue
            .list()
            .await?
            .into_iter()
            .find(|i| i.key == key);
        Ok(queued)
    }

    /// Runs cycles every `interval` until shutdown.
    ///
    /// A failed cycle is logged and retried on the next tick.
    pub async fn run_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Scheduler cycle failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::model::Candidate;
    use crate::publisher::RateLimiter;
    use crate::queue::{MemoryQueue, PopFilter};
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn scheduler(depth: usize) -> (Scheduler, Arc<MemoryStore>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(true));
        let config = SchedulerConfig {
            queue_depth: depth,
            ..Default::default()
        };
        let scheduler = Scheduler::new(
            Ranker::new(config, RateLimiter::Unlimited),
            Duration::from_secs(60),
            store.clone(),
            queue.clone(),
        );
        (scheduler, store, queue)
    }

    #[tokio::test]
    async fn test_cycle_admits_and_reports_malformed() {
        let (scheduler, store, queue) = scheduler(10);
        let mut bad = Candidate::new("", "s");
        bad.target = None;
        store
            .upsert_candidates(&[Candidate::new("a", "s"), Candidate::new("b", "s"), bad])
            .await
            .unwrap();

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.admitted, 2);
        assert_eq!(report.malformed, 1);
        assert_eq!(queue.list().await.unwrap().len(), 2);

        let events = store.list_events(None, 10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == AuditKind::MalformedCandidate));
        assert_eq!(
            events.iter().filter(|e| e.kind == AuditKind::Queued).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_cycle_evicts_dropped_candidates() {
        let (scheduler, store, queue) = scheduler(10);
        store
            .upsert_candidates(&[Candidate::new("a", "s"), Candidate::new("b", "s")])
            .await
            .unwrap();
        scheduler.run_once().await.unwrap();

        store.remove_candidate(&RunKey::new("a", "s")).await.unwrap();
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.evicted, 1);

        let items = queue.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key.target, "b");
    }

    #[tokio::test]
    async fn test_overflow_is_reconsidered_next_cycle() {
        let (scheduler, store, queue) = scheduler(1);
        store
            .upsert_candidates(&[Candidate::new("a", "s"), Candidate::new("b", "s")])
            .await
            .unwrap();

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.overflow, 1);

        let first = queue
            .pop_next(&PopFilter::for_worker("w"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        queue.remove(first.id).await.unwrap();
        store.remove_candidate(&first.key).await.unwrap();

        scheduler.run_once().await.unwrap();
        let items = queue.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_ne!(items[0].key, first.key);
    }

    #[tokio::test]
    async fn test_reschedule_pins_item() {
        let (scheduler, store, queue) = scheduler(10);
        store
            .upsert_candidates(&[Candidate::new("a", "s").with_value(100.0)])
            .await
            .unwrap();

        let item = scheduler
            .reschedule(RunKey::new("b", "s"), None, json!({"why": "manual"}), "operator")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.requestor, "operator");
        assert_eq!(item.maintainer, "b");

        scheduler.run_once().await.unwrap();
        let items = queue.list().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key.target, "b");
    }

    #[tokio::test]
    async fn test_reschedule_rejects_blank_key() {
        let (scheduler, _, _) = scheduler(10);
        let err = scheduler
            .reschedule(RunKey::new(" ", "s"), None, json!(null), "operator")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }
}
