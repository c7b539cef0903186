//! Dispatch and supervision of runs.
//!
//! The runner pulls items from the queue while workers have free slots,
//! binds each to a [`WorkerLease`], follows the worker's progress and
//! writes a terminal [`Run`] when the attempt ends.
//!
//! # States
//!
//! ```text
//!  queued ──► assigned ──► running ──► succeeded
//!               │            ├───────► failed ──► (retry with backoff | terminal | failed-permanent)
//!               │            ├───────► cancelled
//!               └────────────┴───────► lost  (deadline passed without a heartbeat)
//! ```
//!
//! Every transition is written to the audit log and refreshes the target's
//! last-attempt time. A run is finalized by whoever removes its lease from
//! the [`LeaseTable`], so completion, cancellation and expiry can race
//! without producing two terminal records.

pub mod hosts;
pub mod lease;
pub mod retry;
pub mod subprocess;
pub mod worker;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::metrics::MetricsCollector;
use crate::model::{
    fingerprint, AuditEvent, AuditKind, Disposition, FailureKind, Run, RunKey, RunOutcome,
    WorkerReport,
};
use crate::queue::{LeaseRef, PopFilter, Queue, QueueError, QueueItem, QueueState};
use crate::storage::{StateStore, StoreError};

pub use hosts::HostRateLimits;
pub use lease::{Expiry, LeasePhase, LeaseTable, WorkerLease};
pub use retry::RetryPolicy;
pub use subprocess::SubprocessWorker;
pub use worker::{Assignment, Worker, WorkerError, WorkerEvent, WorkerMessage};

/// Errors that can occur in the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Reading or writing state failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// A queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A worker operation failed.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// No active run with this id.
    #[error("Run {0} is not active")]
    UnknownRun(Uuid),
}

/// Broadcast when a run reaches a terminal state.
#[derive(Debug, Clone)]
pub struct RunFinished {
    pub run: Run,
}

/// Timing and capacity settings.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub heartbeat_timeout: Duration,
    pub overall_timeout: Duration,
    pub poll_interval: StdDuration,
    /// How long a cancel signal may take before it is abandoned.
    pub signal_timeout: StdDuration,
    /// Cap on local leases across all workers.
    pub max_concurrency: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl RunnerSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            heartbeat_timeout: Duration::seconds(config.heartbeat_timeout_secs as i64),
            overall_timeout: Duration::seconds(config.overall_timeout_secs as i64),
            poll_interval: StdDuration::from_millis(config.poll_interval_ms),
            signal_timeout: StdDuration::from_secs(config.signal_timeout_secs),
            max_concurrency: config.max_concurrency,
        }
    }
}

/// The dispatch and supervision state machine.
pub struct Runner {
    settings: RunnerSettings,
    retry: RetryPolicy,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    workers: Vec<Arc<dyn Worker>>,
    leases: LeaseTable,
    hosts: HostRateLimits,
    events_tx: mpsc::Sender<WorkerMessage>,
    events_rx: Mutex<Option<mpsc::Receiver<WorkerMessage>>>,
    finished: broadcast::Sender<RunFinished>,
    metrics: MetricsCollector,
}

impl Runner {
    /// Creates a runner without local workers.
    pub fn new(
        settings: RunnerSettings,
        retry: RetryPolicy,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (finished, _) = broadcast::channel(256);

        Self {
            leases: LeaseTable::new(settings.heartbeat_timeout),
            settings,
            retry,
            store,
            queue,
            workers: Vec::new(),
            hosts: HostRateLimits::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            finished,
            metrics: MetricsCollector::new(),
        }
    }

    /// Adds a local worker.
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Subscribes to terminal run events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunFinished> {
        self.finished.subscribe()
    }

    /// Active leases, oldest first.
    pub async fn status(&self) -> Vec<WorkerLease> {
        self.leases.snapshot().await
    }

    /// Name of the worker holding a run's lease.
    pub async fn lease_holder(&self, run_id: Uuid) -> Option<String> {
        self.leases.get(run_id).await.map(|lease| lease.worker)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Runs until shutdown: relays worker events, reaps expired leases and
    /// fills free worker slots from the queue.
    ///
    /// Runs still leased at shutdown are left in the queue as in flight and
    /// recovered on the next start.
    pub async fn dispatch_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            error!("Dispatch loop is already running");
            return;
        };

        match self.recover_orphans().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered = recovered, "Recovered orphaned queue items"),
            Err(e) => warn!(error = %e, "Failed to recover orphaned queue items"),
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(workers = self.workers.len(), "Runner started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let active = self.leases.len().await;
                    info!(active = active, "Runner received shutdown signal");
                    break;
                }
                Some(message) = events.recv() => {
                    if let Err(e) = self.handle_message(message).await {
                        error!(error = %e, "Failed to handle worker event");
                    }
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        *self.events_rx.lock().await = Some(events);
    }

    /// One supervision step: reap, then fill slots.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.reap_expired(now).await {
            error!(error = %e, "Failed to reap expired leases");
        }
        if let Err(e) = self.fill_slots(now).await {
            error!(error = %e, "Failed to dispatch queue items");
        }
        match self.queue.stats(now).await {
            Ok(stats) => self.metrics.set_queue_stats(&stats),
            Err(e) => debug!(error = %e, "Failed to read queue stats"),
        }
    }

    /// Starts queue items on local workers until slots or eligible items run out.
    ///
    /// Returns the number of runs started.
    pub async fn fill_slots(&self, now: DateTime<Utc>) -> Result<usize, RunnerError> {
        let mut started = 0;

        for worker in &self.workers {
            loop {
                let local = self.local_leases().await;
                if local >= self.settings.max_concurrency
                    || self.leases.count_local(worker.name()).await >= worker.capacity()
                {
                    break;
                }

                let filter = PopFilter::for_worker(worker.name())
                    .with_suites(worker.suites().cloned())
                    .with_excluded_hosts(self.hosts.limited(now).await);
                let Some(item) = self.queue.pop_next(&filter, now).await? else {
                    break;
                };

                self.dispatch(worker, item, now).await?;
                started += 1;
            }
        }

        Ok(started)
    }

    async fn local_leases(&self) -> usize {
        self.leases
            .snapshot()
            .await
            .iter()
            .filter(|l| !l.remote)
            .count()
    }

    /// Leases a claimed item to a local worker and starts it.
    async fn dispatch(
        &self,
        worker: &Arc<dyn Worker>,
        item: QueueItem,
        now: DateTime<Utc>,
    ) -> Result<(), RunnerError> {
        let run_id = Uuid::new_v4();
        let assignment = self.assignment(run_id, &item);
        let lease = WorkerLease::new(
            item,
            run_id,
            worker.name(),
            now,
            self.settings.heartbeat_timeout,
            self.settings.overall_timeout,
        );
        self.assign(lease).await?;

        if let Err(e) = worker.start(assignment, self.events_tx.clone()).await {
            warn!(
                run_id = %run_id,
                worker = %worker.name(),
                error = %e,
                "Worker failed to start run"
            );
            if let Some(lease) = self.leases.take(run_id).await {
                let outcome = RunOutcome::Failed {
                    kind: FailureKind::InfraTransient,
                    reason: format!("worker failed to start: {}", e),
                };
                self.finalize(lease, outcome, None).await?;
            }
        }

        Ok(())
    }

    /// Leases the next eligible item to a remote worker.
    ///
    /// Remote workers pull work over HTTP and report through the same
    /// lease table and deadlines as local workers.
    pub async fn assign_remote(
        &self,
        worker: &str,
        suites: Option<std::collections::HashSet<String>>,
    ) -> Result<Option<Assignment>, RunnerError> {
        let now = Utc::now();
        let filter = PopFilter::for_worker(worker)
            .with_suites(suites)
            .with_excluded_hosts(self.hosts.limited(now).await);
        let Some(item) = self.queue.pop_next(&filter, now).await? else {
            return Ok(None);
        };

        let run_id = Uuid::new_v4();
        let assignment = self.assignment(run_id, &item);
        let lease = WorkerLease::new(
            item,
            run_id,
            worker,
            now,
            self.settings.heartbeat_timeout,
            self.settings.overall_timeout,
        )
        .remote();
        self.assign(lease).await?;

        Ok(Some(assignment))
    }

    fn assignment(&self, run_id: Uuid, item: &QueueItem) -> Assignment {
        Assignment {
            run_id,
            target: item.key.target.clone(),
            suite: item.key.suite.clone(),
            attempt: item.attempt,
            context: item.context.clone(),
            heartbeat_interval_secs: (self.settings.heartbeat_timeout.num_seconds() / 3).max(1)
                as u64,
        }
    }

    /// Records the lease and moves the item to `in-progress`.
    async fn assign(&self, lease: WorkerLease) -> Result<(), RunnerError> {
        let run_id = lease.run_id;
        let item_id = lease.item.id;
        let key = lease.item.key.clone();
        let lease_ref = LeaseRef {
            run_id,
            worker: lease.worker.clone(),
        };
        let worker = lease.worker.clone();
        let now = lease.started_at;

        self.leases.insert(lease).await;
        if let Err(e) = self.queue.mark_in_progress(item_id, &lease_ref).await {
            self.leases.take(run_id).await;
            return Err(e.into());
        }

        self.transition(AuditKind::Assigned, run_id, &key, now, format!("assigned to {}", worker))
            .await?;
        self.metrics.set_active_runs(self.leases.len().await);
        info!(run_id = %run_id, key = %key, worker = %worker, "Run assigned");
        Ok(())
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    async fn handle_message(&self, message: WorkerMessage) -> Result<(), RunnerError> {
        match message.event {
            WorkerEvent::Started => {
                self.start_run(message.run_id).await?;
            }
            WorkerEvent::Heartbeat => {
                self.heartbeat(message.run_id).await;
            }
            WorkerEvent::Result { report } => {
                self.complete(message.run_id, report).await?;
            }
        }
        Ok(())
    }

    /// Records that the worker confirmed the run started.
    ///
    /// Returns `false` if the run is unknown or its lease already expired.
    pub async fn start_run(&self, run_id: Uuid) -> Result<bool, RunnerError> {
        let now = Utc::now();
        let Some(lease) = self.leases.mark_running(run_id, now).await else {
            debug!(run_id = %run_id, "Ignoring start for inactive run");
            return Ok(false);
        };

        self.transition(AuditKind::Running, run_id, &lease.item.key, now, "worker started")
            .await?;
        info!(run_id = %run_id, key = %lease.item.key, "Run started");
        Ok(true)
    }

    /// Extends the lease of a live run.
    ///
    /// Returns `false` if the run is unknown or its lease already expired.
    pub async fn heartbeat(&self, run_id: Uuid) -> bool {
        let alive = self.leases.heartbeat(run_id, Utc::now()).await;
        if !alive {
            debug!(run_id = %run_id, "Ignoring heartbeat for inactive run");
        }
        alive
    }

    /// Finalizes a run from the worker's report.
    ///
    /// Reports for runs that are no longer leased (cancelled, or already
    /// reaped as lost) are discarded and return `None`. A report that
    /// arrives after the lease deadline finalizes the run as lost.
    pub async fn complete(
        &self,
        run_id: Uuid,
        report: WorkerReport,
    ) -> Result<Option<Run>, RunnerError> {
        let Some(lease) = self.leases.take(run_id).await else {
            warn!(run_id = %run_id, "Discarding report for inactive run");
            return Ok(None);
        };

        let now = Utc::now();
        if let Some(expiry) = lease.expiry(now) {
            let run = self.finalize(lease, lost_outcome(expiry), None).await?;
            return Ok(Some(run));
        }

        let outcome = report.run_outcome();
        if let (Some(secs), Some(host)) = (report.retry_after_secs, lease.item.host.as_deref()) {
            if outcome.failure_kind().is_some_and(|k| k.is_transient()) {
                if let Some(until) = now.checked_add_signed(self.retry.retry_after(secs)) {
                    info!(host = host, until = %until, "Host asked us to back off");
                    self.hosts.limit(host, until).await;
                }
            }
        }

        let run = self.finalize(lease, outcome, Some(report)).await?;
        Ok(Some(run))
    }

    // =========================================================================
    // Cancellation, expiry and recovery
    // =========================================================================

    /// Cancels an active run.
    ///
    /// The worker is signalled on a best-effort basis; the lease is released
    /// and the target freed whether or not the signal is acknowledged.
    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> Result<Run, RunnerError> {
        let lease = self
            .leases
            .take(run_id)
            .await
            .ok_or(RunnerError::UnknownRun(run_id))?;

        if !lease.remote {
            self.signal_cancel(&lease).await;
        }

        let outcome = RunOutcome::Cancelled {
            reason: reason.to_string(),
        };
        self.finalize(lease, outcome, None).await
    }

    async fn signal_cancel(&self, lease: &WorkerLease) {
        let Some(worker) = self.workers.iter().find(|w| w.name() == lease.worker) else {
            return;
        };
        match tokio::time::timeout(self.settings.signal_timeout, worker.cancel(lease.run_id)).await
        {
            Ok(Ok(())) => debug!(run_id = %lease.run_id, "Cancel signal delivered"),
            Ok(Err(e)) => {
                warn!(run_id = %lease.run_id, error = %e, "Cancel signal not delivered")
            }
            Err(_) => warn!(run_id = %lease.run_id, "Cancel signal timed out"),
        }
    }

    /// Finalizes every lease whose deadline has passed as lost.
    ///
    /// A lease that fails to finalize is kept for the next reap.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Run>, RunnerError> {
        let mut runs = Vec::new();
        for (lease, expiry) in self.leases.take_expired(now).await {
            self.metrics.record_lease_expired();
            warn!(
                run_id = %lease.run_id,
                key = %lease.item.key,
                worker = %lease.worker,
                "Lease expired, worker presumed lost"
            );
            if !lease.remote {
                self.signal_cancel(&lease).await;
            }
            match self.finalize(lease, lost_outcome(expiry), None).await {
                Ok(run) => runs.push(run),
                Err(e) => error!(error = %e, "Failed to finalize lost run"),
            }
        }
        Ok(runs)
    }

    /// Finalizes queue items left in flight by a previous process.
    ///
    /// Items that are claimed or in progress without a live lease are
    /// treated as lost, which requeues them through the retry policy.
    pub async fn recover_orphans(&self) -> Result<usize, RunnerError> {
        let now = Utc::now();
        let mut recovered = 0;

        for item in self.queue.list().await? {
            if !item.state.is_in_flight() || self.leases.holds_item(item.id).await {
                continue;
            }

            let worker = item
                .assigned_worker
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let detail = match (item.state, item.run_id) {
                (QueueState::InProgress, Some(previous)) => {
                    format!("recovered run {} from {}", previous, worker)
                }
                _ => format!("recovered claim from {}", worker),
            };

            // A fresh id: the previous run may already be recorded.
            let run_id = Uuid::new_v4();
            let key = item.key.clone();
            let lease = WorkerLease::new(
                item,
                run_id,
                worker,
                now,
                self.settings.heartbeat_timeout,
                self.settings.overall_timeout,
            );

            self.append(AuditKind::Recovered, Some(run_id), &key, now, detail)
                .await?;
            let outcome = RunOutcome::Failed {
                kind: FailureKind::WorkerLost,
                reason: "runner restarted while the run was in flight".to_string(),
            };
            self.finalize(lease, outcome, None).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Writes the terminal run, then requeues or removes the queue item.
    ///
    /// The lease must already be removed from the table. If either write
    /// fails the lease goes back in the table already expired, so the next
    /// reap finalizes the item as lost instead of leaving it in flight.
    async fn finalize(
        &self,
        lease: WorkerLease,
        outcome: RunOutcome,
        report: Option<WorkerReport>,
    ) -> Result<Run, RunnerError> {
        let now = Utc::now();
        let retained = lease.clone();
        let item = lease.item;
        let min_backoff = report
            .as_ref()
            .and_then(|r| r.retry_after_secs)
            .map(|secs| self.retry.retry_after(secs));
        let disposition = self
            .retry
            .disposition(&outcome, item.attempt, now, min_backoff);

        let (artifacts_ref, log_ref, change) = match report {
            Some(r) => (r.artifacts_ref, r.log_ref, r.change),
            None => (None, None, None),
        };

        let run = Run {
            id: lease.run_id,
            key: item.key.clone(),
            maintainer: item.maintainer.clone(),
            worker: lease.worker,
            attempt: item.attempt,
            context: item.context.clone(),
            started_at: lease.started_at,
            finished_at: now,
            outcome,
            disposition,
            artifacts_ref,
            log_ref,
            change,
        };

        let blocked = run
            .disposition
            .blocks_candidate()
            .then(|| fingerprint(&item.key.target, &item.key.suite, &item.context));
        if let Err(e) = self.store.record_run(&run, blocked.as_deref()).await {
            self.retain_for_reaping(retained, now).await;
            return Err(e.into());
        }

        let released = match &run.disposition {
            Disposition::Retry { not_before, .. } => {
                let backoff = (*not_before - now).max(Duration::zero());
                self.queue.requeue(item.id, backoff).await.map(|_| ())
            }
            _ => self.queue.remove(item.id).await.map(|_| ()),
        };
        if let Err(e) = released {
            self.retain_for_reaping(retained, now).await;
            return Err(e.into());
        }

        if let Disposition::Retry {
            next_attempt,
            not_before,
        } = &run.disposition
        {
            if let Some(kind) = run.outcome.failure_kind() {
                self.metrics.record_retry(kind);
            }
            self.append(
                AuditKind::Requeued,
                Some(run.id),
                &run.key,
                now,
                format!("attempt {} not before {}", next_attempt, not_before),
            )
            .await?;
        }

        self.append(
            AuditKind::for_run_state(run.outcome.state()),
            Some(run.id),
            &run.key,
            now,
            run.outcome.reason(),
        )
        .await?;

        self.metrics.record_run(&run);
        self.metrics.set_active_runs(self.leases.len().await);

        info!(
            run_id = %run.id,
            key = %run.key,
            state = run.outcome.state(),
            outcome = run.outcome.label(),
            attempt = run.attempt,
            "Run finished"
        );

        // No subscribers is fine.
        let _ = self.finished.send(RunFinished { run: run.clone() });
        Ok(run)
    }

    /// Puts back a lease whose finalization failed, expired and under a
    /// fresh run id since the original one may already be recorded.
    async fn retain_for_reaping(&self, mut lease: WorkerLease, now: DateTime<Utc>) {
        warn!(
            run_id = %lease.run_id,
            key = %lease.item.key,
            "Failed to finalize run, leaving it for the reaper"
        );
        lease.run_id = Uuid::new_v4();
        lease.heartbeat_deadline = now;
        self.leases.insert(lease).await;
    }

    /// Refreshes the target's last-attempt time and records the transition.
    async fn transition(
        &self,
        kind: AuditKind,
        run_id: Uuid,
        key: &RunKey,
        at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Result<(), RunnerError> {
        self.store.touch_target(key, at).await?;
        self.append(kind, Some(run_id), key, at, detail).await
    }

    async fn append(
        &self,
        kind: AuditKind,
        run_id: Option<Uuid>,
        key: &RunKey,
        at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Result<(), RunnerError> {
        let mut event = AuditEvent::new(kind, detail).with_key(key.clone()).at(at);
        event.run_id = run_id;
        self.store.append_event(&event).await?;
        Ok(())
    }
}

fn lost_outcome(expiry: Expiry) -> RunOutcome {
    let reason = match expiry {
        Expiry::Heartbeat => "no heartbeat before the lease deadline",
        Expiry::Overall => "run exceeded the overall timeout",
    };
    RunOutcome::Failed {
        kind: FailureKind::WorkerLost,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeDescription, TargetState};
    use crate::queue::MemoryQueue;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Accepts assignments and records them; tests drive the events.
    struct FakeWorker {
        name: String,
        capacity: usize,
        fail_start: bool,
        assignments: Mutex<Vec<Assignment>>,
        cancelled: Mutex<Vec<Uuid>>,
    }

    impl FakeWorker {
        fn new(capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                name: "fake".into(),
                capacity,
                fail_start: false,
                assignments: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn suites(&self) -> Option<&HashSet<String>> {
            None
        }

        fn capacity(&self) -> usize {
            self.capacity
        }

        async fn start(
            &self,
            assignment: Assignment,
            _events: mpsc::Sender<WorkerMessage>,
        ) -> Result<(), WorkerError> {
            if self.fail_start {
                return Err(WorkerError::Spawn("no such command".into()));
            }
            self.assignments.lock().await.push(assignment);
            Ok(())
        }

        async fn cancel(&self, run_id: Uuid) -> Result<(), WorkerError> {
            self.cancelled.lock().await.push(run_id);
            Ok(())
        }
    }

    struct Fixture {
        runner: Runner,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        worker: Arc<FakeWorker>,
    }

    fn fixture(worker: Arc<FakeWorker>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(true));
        let settings = RunnerSettings {
            heartbeat_timeout: Duration::seconds(60),
            overall_timeout: Duration::seconds(3600),
            poll_interval: StdDuration::from_millis(10),
            signal_timeout: StdDuration::from_secs(1),
            max_concurrency: 8,
        };
        let retry = RetryPolicy::new(2, Duration::seconds(60), Duration::seconds(600));
        let runner = Runner::new(settings, retry, store.clone(), queue.clone())
            .with_worker(worker.clone());
        Fixture {
            runner,
            store,
            queue,
            worker,
        }
    }

    async fn enqueue(queue: &MemoryQueue, target: &str) {
        let item = QueueItem::new(
            RunKey::new(target, "lintian-fixes"),
            "maint",
            serde_json::json!({"target": target}),
            1.0,
        );
        queue.push(vec![item]).await.unwrap();
    }

    fn change() -> ChangeDescription {
        ChangeDescription {
            summary: "Fix lintian warnings".into(),
            diff_summary: "2 files changed".into(),
            branches: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_success() {
        let f = fixture(FakeWorker::new(2));
        enqueue(&f.queue, "https://example.com/a").await;

        assert_eq!(f.runner.fill_slots(Utc::now()).await.unwrap(), 1);
        let run_id = f.worker.assignments.lock().await[0].run_id;
        assert!(f.runner.start_run(run_id).await.unwrap());
        assert!(f.runner.heartbeat(run_id).await);

        let run = f
            .runner
            .complete(run_id, WorkerReport::success(change()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.disposition, Disposition::Completed);
        assert!(f.queue.list().await.unwrap().is_empty());
        assert!(f.runner.status().await.is_empty());

        let state: TargetState = f.store.get_target_state(&run.key).await.unwrap().unwrap();
        assert_eq!(state.successes, 1);

        let kinds: Vec<AuditKind> = f
            .store
            .list_events(Some(run_id), 10)
            .await
            .unwrap()
            .into_iter()
            .rev()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![AuditKind::Assigned, AuditKind::Running, AuditKind::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_dispatch_loop_runs_on_spawned_task() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        let runner = Arc::new(f.runner);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.dispatch_loop(shutdown_rx).await }
        });
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while runner.status().await.is_empty() {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_capacity_limits_dispatch() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        enqueue(&f.queue, "b").await;

        assert_eq!(f.runner.fill_slots(Utc::now()).await.unwrap(), 1);
        assert_eq!(f.runner.fill_slots(Utc::now()).await.unwrap(), 0);
        assert_eq!(f.runner.status().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "https://example.com/a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;

        let mut report = WorkerReport::failure(FailureKind::InfraTransient, "network down");
        report.retry_after_secs = Some(500);
        let run = f.runner.complete(run_id, report).await.unwrap().unwrap();
        assert!(matches!(run.disposition, Disposition::Retry { next_attempt: 1, .. }));

        let items = f.queue.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempt, 1);
        assert!(items[0].earliest_eligible > Utc::now() + Duration::seconds(400));

        // The host is limited too.
        let mut other = QueueItem::new(
            RunKey::new("https://example.com/b", "s"),
            "m",
            serde_json::Value::Null,
            1.0,
        );
        other.earliest_eligible = Utc::now() - Duration::seconds(1);
        f.queue.push(vec![other]).await.unwrap();
        assert_eq!(f.runner.fill_slots(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_retry_after_is_capped() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "https://example.com/a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;

        let mut report = WorkerReport::failure(FailureKind::InfraTransient, "slow down");
        report.retry_after_secs = Some(10_000_000_000_000);
        let run = f.runner.complete(run_id, report).await.unwrap().unwrap();

        let Disposition::Retry { not_before, .. } = run.disposition else {
            panic!("expected retry, got {:?}", run.disposition);
        };
        assert!(not_before <= Utc::now() + Duration::seconds(600));
        let item = &f.queue.list().await.unwrap()[0];
        assert!(item.earliest_eligible <= Utc::now() + Duration::seconds(601));
    }

    #[tokio::test]
    async fn test_logic_failure_is_terminal_and_blocks_candidate() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;

        let report = WorkerReport::failure(FailureKind::LogicFailure, "nothing to do");
        let run = f.runner.complete(run_id, report).await.unwrap().unwrap();
        assert_eq!(run.disposition, Disposition::Terminal);
        assert!(f.queue.list().await.unwrap().is_empty());

        let state = f.store.get_target_state(&run.key).await.unwrap().unwrap();
        assert_eq!(
            state.blocked_fingerprint,
            Some(fingerprint("a", "lintian-fixes", &run.context))
        );
    }

    #[tokio::test]
    async fn test_expired_lease_is_lost_and_late_report_discarded() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;

        let runs = f
            .runner
            .reap_expired(Utc::now() + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome.state(), "lost");
        assert!(f.worker.cancelled.lock().await.contains(&run_id));

        let late = f
            .runner
            .complete(run_id, WorkerReport::success(change()))
            .await
            .unwrap();
        assert!(late.is_none());
        assert_eq!(f.store.list_runs(None, 10).await.unwrap().len(), 1);
        assert_eq!(f.queue.list().await.unwrap()[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_failed_finalize_is_reaped_as_lost() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;

        f.store.fail("record_run");
        assert!(f
            .runner
            .complete(run_id, WorkerReport::success(change()))
            .await
            .is_err());

        // The item is still held, by a lease that is already expired.
        let held = f.runner.status().await;
        assert_eq!(held.len(), 1);
        assert_ne!(held[0].run_id, run_id);
        assert!(f.queue.list().await.unwrap()[0].state.is_in_flight());

        // Still failing: the reaper keeps the lease for another try.
        let later = Utc::now() + Duration::seconds(1);
        assert!(f.runner.reap_expired(later).await.unwrap().is_empty());
        assert_eq!(f.runner.status().await.len(), 1);

        f.store.heal("record_run");
        let runs = f
            .runner
            .reap_expired(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome.state(), "lost");
        assert!(f.runner.status().await.is_empty());

        let item = &f.queue.list().await.unwrap()[0];
        assert_eq!(item.state, QueueState::Queued);
        assert_eq!(item.attempt, 1);
    }

    #[tokio::test]
    async fn test_cancel_frees_target() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;
        f.runner.start_run(run_id).await.unwrap();

        let run = f.runner.cancel(run_id, "operator request").await.unwrap();
        assert_eq!(run.disposition, Disposition::Cancelled);
        assert!(f.queue.list().await.unwrap().is_empty());
        assert!(matches!(
            f.runner.cancel(run_id, "again").await,
            Err(RunnerError::UnknownRun(_))
        ));

        // Cancelled runs do not block the candidate.
        let state = f.store.get_target_state(&run.key).await.unwrap().unwrap();
        assert!(state.blocked_fingerprint.is_none());
    }

    #[tokio::test]
    async fn test_start_failure_is_transient() {
        let worker = Arc::new(FakeWorker {
            name: "fake".into(),
            capacity: 1,
            fail_start: true,
            assignments: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        });
        let f = fixture(worker);
        enqueue(&f.queue, "a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();

        let runs = f.store.list_runs(None, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome.failure_kind(), Some(FailureKind::InfraTransient));
        assert_eq!(f.queue.list().await.unwrap()[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let f = fixture(FakeWorker::new(1));
        enqueue(&f.queue, "a").await;
        let claimed = f
            .queue
            .pop_next(&PopFilter::for_worker("previous"), Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.runner.recover_orphans().await.unwrap(), 1);
        let item = f.queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(item.state, QueueState::Queued);
        assert_eq!(item.attempt, 1);

        let events = f.store.list_events(None, 10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == AuditKind::Recovered));
        assert!(events.iter().any(|e| e.kind == AuditKind::Lost));
    }

    #[tokio::test]
    async fn test_remote_assignment() {
        let f = fixture(FakeWorker::new(0));
        enqueue(&f.queue, "a").await;

        let assignment = f
            .runner
            .assign_remote("remote-1", None)
            .await
            .unwrap()
            .unwrap();
        assert!(f.runner.assign_remote("remote-2", None).await.unwrap().is_none());
        let status = f.runner.status().await;
        assert!(status[0].remote);

        let run = f
            .runner
            .complete(assignment.run_id, WorkerReport::success(change()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.worker, "remote-1");
        assert!(run.is_publishable());
    }

    #[tokio::test]
    async fn test_finished_runs_are_broadcast() {
        let f = fixture(FakeWorker::new(1));
        let mut rx = f.runner.subscribe();
        enqueue(&f.queue, "a").await;
        f.runner.fill_slots(Utc::now()).await.unwrap();
        let run_id = f.worker.assignments.lock().await[0].run_id;
        f.runner
            .complete(run_id, WorkerReport::success(change()))
            .await
            .unwrap();

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.run.id, run_id);
    }
}
