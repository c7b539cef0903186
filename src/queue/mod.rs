//! Persistent, ordered work queue.
//!
//! The queue holds one item per (target, suite). Items move through three
//! states:
//!
//! ```text
//!            push                pop_next              mark_in_progress
//!  (absent) ─────► queued ──────────────────► claimed ─────────────────► in-progress
//!                    ▲                                                      │
//!                    └──────────── requeue (attempt + 1, backoff) ──────────┤
//!                                                                           │
//!                               remove ◄────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - `pop_next` claims atomically: concurrent callers never receive the same item.
//! - At most one item per (target, suite) is claimed or in progress. With
//!   target exclusivity enabled, at most one item per target.
//! - Items are returned in priority order, skipping items whose backoff has
//!   not elapsed.

pub mod memory;
pub mod sqlite;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::RunKey;
use crate::storage::StoreError;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

/// Requestor recorded on items admitted by the scheduler.
pub const SCHEDULER_REQUESTOR: &str = "scheduler";

/// Priority given to manually rescheduled items so they run next.
pub const MANUAL_PRIORITY: f64 = 1.0e9;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Query execution failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to serialize item data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Item not found in the queue.
    #[error("Queue item {0} not found")]
    ItemNotFound(Uuid),

    /// The item is not in the state the operation requires.
    #[error("Queue item {id} is {state}, expected {expected}")]
    InvalidState {
        id: Uuid,
        state: QueueState,
        expected: QueueState,
    },
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueState {
    /// Waiting for dispatch.
    Queued,
    /// Returned by `pop_next`; no lease recorded yet.
    Claimed,
    /// Bound to a worker lease.
    InProgress,
}

impl QueueState {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Claimed => "claimed",
            QueueState::InProgress => "in-progress",
        }
    }

    /// Whether the item is claimed or running.
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, QueueState::Queued)
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueState::Queued),
            "claimed" => Ok(QueueState::Claimed),
            "in-progress" => Ok(QueueState::InProgress),
            other => Err(format!("unknown queue state: {}", other)),
        }
    }
}

/// An admitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Item identifier, stable across retries.
    pub id: Uuid,
    /// The (target, suite) pair.
    pub key: RunKey,
    /// Maintainer bucket for publish rate limiting.
    pub maintainer: String,
    /// Host of the target, for host rate limiting.
    pub host: Option<String>,
    /// Worker context.
    pub context: serde_json::Value,
    /// Scheduler-assigned priority; higher runs first.
    pub priority: f64,
    /// Seconds since the last attempt when the item was ranked.
    pub staleness_secs: i64,
    /// Expected run time based on the previous run.
    pub estimated_duration_secs: Option<f64>,
    /// Number of previous attempts of this item.
    pub attempt: u32,
    /// The item is not dispatched before this time.
    pub earliest_eligible: DateTime<Utc>,
    pub state: QueueState,
    /// Worker holding the item, once claimed.
    pub assigned_worker: Option<String>,
    /// Run currently executing the item.
    pub run_id: Option<Uuid>,
    /// Who admitted the item: the scheduler or an operator.
    pub requestor: String,
    /// When the item was first admitted.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    /// Creates a scheduler item that is eligible immediately.
    pub fn new(
        key: RunKey,
        maintainer: impl Into<String>,
        context: serde_json::Value,
        priority: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            host: key.host(),
            key,
            maintainer: maintainer.into(),
            context,
            priority,
            staleness_secs: 0,
            estimated_duration_secs: None,
            attempt: 0,
            earliest_eligible: now,
            state: QueueState::Queued,
            assigned_worker: None,
            run_id: None,
            requestor: SCHEDULER_REQUESTOR.to_string(),
            enqueued_at: now,
        }
    }

    /// Sets the staleness used for tie-breaking.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness_secs = staleness.num_seconds();
        self
    }

    /// Sets the estimated duration.
    pub fn with_estimated_duration(mut self, secs: Option<f64>) -> Self {
        self.estimated_duration_secs = secs;
        self
    }

    /// Sets the requestor.
    pub fn with_requestor(mut self, requestor: impl Into<String>) -> Self {
        self.requestor = requestor.into();
        self
    }

    /// Whether the scheduler must leave this item alone.
    ///
    /// Retries and operator requests are pinned: they are neither evicted
    /// nor counted against the scheduler's queue depth.
    pub fn is_pinned(&self) -> bool {
        self.attempt > 0 || self.requestor != SCHEDULER_REQUESTOR
    }

    /// Whether the item's backoff has elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.earliest_eligible <= now
    }
}

/// Dispatch order: priority, then staleness, then key.
pub fn dispatch_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| b.staleness_secs.cmp(&a.staleness_secs))
        .then_with(|| a.key.cmp(&b.key))
}

/// What a worker asking for work can accept.
#[derive(Debug, Clone, Default)]
pub struct PopFilter {
    /// Name of the worker claiming the item.
    pub worker: String,
    /// Suites the worker supports; any suite if `None`.
    pub suites: Option<HashSet<String>>,
    /// Hosts that are currently rate limited.
    pub excluded_hosts: HashSet<String>,
}

impl PopFilter {
    /// A filter accepting any item for `worker`.
    pub fn for_worker(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            ..Default::default()
        }
    }

    /// Restricts the filter to the given suites.
    pub fn with_suites(mut self, suites: Option<HashSet<String>>) -> Self {
        self.suites = suites;
        self
    }

    /// Excludes items on the given hosts.
    pub fn with_excluded_hosts(mut self, hosts: HashSet<String>) -> Self {
        self.excluded_hosts = hosts;
        self
    }

    /// Whether an item passes the filter.
    pub fn accepts(&self, item: &QueueItem) -> bool {
        let suite_ok = self
            .suites
            .as_ref()
            .map_or(true, |s| s.contains(&item.key.suite));
        let host_ok = item
            .host
            .as_ref()
            .map_or(true, |h| !self.excluded_hosts.contains(h));
        suite_ok && host_ok
    }
}

/// Reference to the lease an item is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRef {
    /// Run executing the item.
    pub run_id: Uuid,
    /// Worker holding the lease.
    pub worker: String,
}

/// Statistics about the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items waiting whose backoff has elapsed.
    pub ready: usize,
    /// Items waiting for their backoff to elapse.
    pub deferred: usize,
    /// Items claimed but not yet leased.
    pub claimed: usize,
    /// Items bound to a lease.
    pub in_progress: usize,
}

impl QueueStats {
    /// Returns the total number of items.
    pub fn total(&self) -> usize {
        self.ready + self.deferred + self.claimed + self.in_progress
    }

    pub(crate) fn from_items<'a>(
        items: impl IntoIterator<Item = &'a QueueItem>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self::default();
        for item in items {
            match item.state {
                QueueState::Queued if item.is_eligible(now) => stats.ready += 1,
                QueueState::Queued => stats.deferred += 1,
                QueueState::Claimed => stats.claimed += 1,
                QueueState::InProgress => stats.in_progress += 1,
            }
        }
        stats
    }
}

/// Durable work queue shared by the scheduler and the runner.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Admits items, upserting by (target, suite).
    ///
    /// Items already claimed or in progress are left untouched, and a
    /// scheduler item never overwrites an operator request. Returns the
    /// number of items inserted or updated.
    async fn push(&self, items: Vec<QueueItem>) -> Result<usize, QueueError>;

    /// Claims the highest-priority eligible item accepted by `filter`.
    async fn pop_next(
        &self,
        filter: &PopFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError>;

    /// Binds a claimed item to a worker lease.
    async fn mark_in_progress(&self, item_id: Uuid, lease: &LeaseRef) -> Result<(), QueueError>;

    /// Returns an item to the queue for another attempt after `backoff`.
    async fn requeue(&self, item_id: Uuid, backoff: Duration) -> Result<QueueItem, QueueError>;

    /// Removes an item. Returns whether it existed.
    async fn remove(&self, item_id: Uuid) -> Result<bool, QueueError>;

    /// Returns an item by id.
    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError>;

    /// Lists all items in dispatch order.
    async fn list(&self) -> Result<Vec<QueueItem>, QueueError>;

    /// Evicts queued, unpinned items whose key is not in `keep`.
    async fn retain_pending(&self, keep: &HashSet<RunKey>) -> Result<usize, QueueError>;

    /// Returns queue statistics.
    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError>;
}
