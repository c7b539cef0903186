//! In-memory queue used by tests and single-process deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::RunKey;

use super::{
    dispatch_order, LeaseRef, PopFilter, Queue, QueueError, QueueItem, QueueState, QueueStats,
    SCHEDULER_REQUESTOR,
};

/// Queue holding items in process memory.
///
/// All operations take a single lock, which makes claims trivially atomic.
pub struct MemoryQueue {
    items: Mutex<HashMap<Uuid, QueueItem>>,
    target_exclusive: bool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MemoryQueue {
    /// Creates an empty queue.
    ///
    /// # Arguments
    ///
    /// * `target_exclusive` - never run two suites of one target at once
    pub fn new(target_exclusive: bool) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            target_exclusive,
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, items: Vec<QueueItem>) -> Result<usize, QueueError> {
        let mut queue = self.items.lock().await;
        let mut written = 0;

        for mut item in items {
            let existing = queue.values_mut().find(|i| i.key == item.key);
            match existing {
                Some(existing) => {
                    if existing.state.is_in_flight() {
                        continue;
                    }
                    let incoming_manual = item.requestor != SCHEDULER_REQUESTOR;
                    if !incoming_manual && existing.requestor != SCHEDULER_REQUESTOR {
                        continue;
                    }
                    existing.priority = item.priority;
                    existing.staleness_secs = item.staleness_secs;
                    existing.estimated_duration_secs = item.estimated_duration_secs;
                    existing.maintainer = item.maintainer;
                    existing.host = item.host;
                    existing.context = item.context;
                    if incoming_manual {
                        existing.requestor = item.requestor;
                        existing.earliest_eligible = item.earliest_eligible;
                    }
                    written += 1;
                }
                None => {
                    item.state = QueueState::Queued;
                    item.assigned_worker = None;
                    item.run_id = None;
                    queue.insert(item.id, item);
                    written += 1;
                }
            }
        }

        Ok(written)
    }

    async fn pop_next(
        &self,
        filter: &PopFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let mut queue = self.items.lock().await;

        let id = {
            let busy_targets: HashSet<&str> = queue
                .values()
                .filter(|i| i.state.is_in_flight())
                .map(|i| i.key.target.as_str())
                .collect();

            let mut eligible: Vec<&QueueItem> = queue
                .values()
                .filter(|i| i.state == QueueState::Queued && i.is_eligible(now))
                .filter(|i| {
                    !self.target_exclusive || !busy_targets.contains(i.key.target.as_str())
                })
                .filter(|i| filter.accepts(i))
                .collect();
            eligible.sort_by(|a, b| dispatch_order(a, b));

            match eligible.first() {
                Some(item) => item.id,
                None => return Ok(None),
            }
        };

        let Some(item) = queue.get_mut(&id) else {
            return Ok(None);
        };
        item.state = QueueState::Claimed;
        item.assigned_worker = Some(filter.worker.clone());
        Ok(Some(item.clone()))
    }

    async fn mark_in_progress(&self, item_id: Uuid, lease: &LeaseRef) -> Result<(), QueueError> {
        let mut queue = self.items.lock().await;
        let item = queue
            .get_mut(&item_id)
            .ok_or(QueueError::ItemNotFound(item_id))?;

        if item.state != QueueState::Claimed {
            return Err(QueueError::InvalidState {
                id: item_id,
                state: item.state,
                expected: QueueState::Claimed,
            });
        }

        item.state = QueueState::InProgress;
        item.run_id = Some(lease.run_id);
        item.assigned_worker = Some(lease.worker.clone());
        Ok(())
    }

    async fn requeue(&self, item_id: Uuid, backoff: Duration) -> Result<QueueItem, QueueError> {
        let mut queue = self.items.lock().await;
        let item = queue
            .get_mut(&item_id)
            .ok_or(QueueError::ItemNotFound(item_id))?;

        item.state = QueueState::Queued;
        item.attempt += 1;
        item.earliest_eligible = Utc::now() + backoff;
        item.assigned_worker = None;
        item.run_id = None;
        Ok(item.clone())
    }

    async fn remove(&self, item_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.items.lock().await.remove(&item_id).is_some())
    }

    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.items.lock().await.get(&item_id).cloned())
    }

    async fn list(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut items: Vec<QueueItem> = self.items.lock().await.values().cloned().collect();
        items.sort_by(dispatch_order);
        Ok(items)
    }

    async fn retain_pending(&self, keep: &HashSet<RunKey>) -> Result<usize, QueueError> {
        let mut queue = self.items.lock().await;
        let before = queue.len();
        queue.retain(|_, i| i.state.is_in_flight() || i.is_pinned() || keep.contains(&i.key));
        Ok(before - queue.len())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let queue = self.items.lock().await;
        Ok(QueueStats::from_items(queue.values(), now))
    }
}
