//! Worker leases and the table that owns them.
//!
//! A lease binds a queue item to a worker until the run finishes, is
//! cancelled, or misses its deadline. Liveness is judged only by the
//! deadlines kept here; a worker's own claims about its health are not
//! consulted.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::queue::QueueItem;

/// Supervision phase of a leased run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeasePhase {
    /// The worker accepted the assignment.
    Assigned,
    /// The worker confirmed the run started.
    Running,
}

/// Why a lease expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No heartbeat before the heartbeat deadline.
    Heartbeat,
    /// The run exceeded the overall timeout.
    Overall,
}

/// Binding of a queue item to a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLease {
    pub run_id: Uuid,
    pub item: QueueItem,
    /// Name of the worker holding the lease.
    pub worker: String,
    pub phase: LeasePhase,
    pub started_at: DateTime<Utc>,
    /// Extended by every heartbeat.
    pub heartbeat_deadline: DateTime<Utc>,
    /// Fixed at assignment.
    pub overall_deadline: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Held by a worker that pulls work over HTTP.
    pub remote: bool,
}

impl WorkerLease {
    /// Creates a lease in the `assigned` phase.
    pub fn new(
        item: QueueItem,
        run_id: Uuid,
        worker: impl Into<String>,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
        overall_timeout: Duration,
    ) -> Self {
        Self {
            run_id,
            item,
            worker: worker.into(),
            phase: LeasePhase::Assigned,
            started_at: now,
            heartbeat_deadline: now + heartbeat_timeout,
            overall_deadline: now + overall_timeout,
            last_heartbeat: None,
            remote: false,
        }
    }

    /// Marks the lease as held by a remote worker.
    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// The earlier of the two deadlines.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.heartbeat_deadline.min(self.overall_deadline)
    }

    /// Returns why the lease expired, if it has.
    pub fn expiry(&self, now: DateTime<Utc>) -> Option<Expiry> {
        if now >= self.overall_deadline {
            Some(Expiry::Overall)
        } else if now >= self.heartbeat_deadline {
            Some(Expiry::Heartbeat)
        } else {
            None
        }
    }
}

/// All live leases, keyed by run id.
///
/// Removing a lease is the single point where a run is finalized: whoever
/// takes it out of the table (completion, cancel or the reaper) owns the
/// terminal transition, so a run is never finalized twice.
pub struct LeaseTable {
    leases: Mutex<HashMap<Uuid, WorkerLease>>,
    heartbeat_timeout: Duration,
}

impl LeaseTable {
    /// Creates an empty table.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    pub async fn insert(&self, lease: WorkerLease) {
        self.leases.lock().await.insert(lease.run_id, lease);
    }

    /// Removes and returns a lease.
    pub async fn take(&self, run_id: Uuid) -> Option<WorkerLease> {
        self.leases.lock().await.remove(&run_id)
    }

    /// Returns a copy of a lease.
    pub async fn get(&self, run_id: Uuid) -> Option<WorkerLease> {
        self.leases.lock().await.get(&run_id).cloned()
    }

    /// Extends the heartbeat deadline.
    ///
    /// Returns `false` for unknown runs and for leases whose deadline has
    /// already passed: a late heartbeat does not revive a lost run.
    pub async fn heartbeat(&self, run_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&run_id) {
            Some(lease) if lease.expiry(now).is_none() => {
                lease.last_heartbeat = Some(now);
                lease.heartbeat_deadline = now + self.heartbeat_timeout;
                true
            }
            _ => false,
        }
    }

    /// Moves a lease to `running`, counting the start as a heartbeat.
    ///
    /// Returns `None` for unknown or expired leases.
    pub async fn mark_running(&self, run_id: Uuid, now: DateTime<Utc>) -> Option<WorkerLease> {
        let mut leases = self.leases.lock().await;
        let lease = leases.get_mut(&run_id)?;
        if lease.expiry(now).is_some() {
            return None;
        }
        lease.phase = LeasePhase::Running;
        lease.last_heartbeat = Some(now);
        lease.heartbeat_deadline = now + self.heartbeat_timeout;
        Some(lease.clone())
    }

    /// Removes and returns every expired lease.
    pub async fn take_expired(&self, now: DateTime<Utc>) -> Vec<(WorkerLease, Expiry)> {
        let mut leases = self.leases.lock().await;
        let expired: Vec<Uuid> = leases
            .values()
            .filter(|l| l.expiry(now).is_some())
            .map(|l| l.run_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| leases.remove(&id))
            .filter_map(|l| l.expiry(now).map(|e| (l, e)))
            .collect()
    }

    /// Whether any lease holds the given queue item.
    pub async fn holds_item(&self, item_id: Uuid) -> bool {
        self.leases
            .lock()
            .await
            .values()
            .any(|l| l.item.id == item_id)
    }

    /// Number of local leases held by a worker.
    pub async fn count_local(&self, worker: &str) -> usize {
        self.leases
            .lock()
            .await
            .values()
            .filter(|l| !l.remote && l.worker == worker)
            .count()
    }

    /// All leases, oldest first.
    pub async fn snapshot(&self) -> Vec<WorkerLease> {
        let mut leases: Vec<WorkerLease> = self.leases.lock().await.values().cloned().collect();
        leases.sort_by_key(|l| (l.started_at, l.run_id));
        leases
    }

    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leases.lock().await.is_empty()
    }
}
