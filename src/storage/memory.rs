//! In-memory implementation of [`StateStore`] for tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{
    AuditEvent, Candidate, PublishPolicy, PublishRecord, PublishStatus, ProposalStatus, Run,
    RunKey, RunOutcome, TargetState,
};

use super::{StateStore, StoreError};

#[derive(Default)]
struct Inner {
    candidates: Vec<Candidate>,
    targets: BTreeMap<RunKey, TargetState>,
    runs: Vec<Run>,
    policies: BTreeMap<String, PublishPolicy>,
    publish: HashMap<Uuid, PublishRecord>,
    events: Vec<AuditEvent>,
}

/// State store holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    #[cfg(test)]
    faults: std::sync::Mutex<HashMap<&'static str, u32>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the named operation fail until [`MemoryStore::heal`].
    #[cfg(test)]
    pub(crate) fn fail(&self, op: &'static str) {
        self.fail_times(op, u32::MAX);
    }

    /// Makes the named operation fail `times` times.
    #[cfg(test)]
    pub(crate) fn fail_times(&self, op: &'static str, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op, times);
        }
    }

    #[cfg(test)]
    pub(crate) fn heal(&self, op: &'static str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.remove(op);
        }
    }

    #[cfg(test)]
    fn fault(&self, op: &'static str) -> Result<(), StoreError> {
        let Ok(mut faults) = self.faults.lock() else {
            return Ok(());
        };
        match faults.get_mut(op) {
            Some(left) if *left > 0 => {
                if *left != u32::MAX {
                    *left -= 1;
                }
                Err(StoreError::Database(sqlx::Error::PoolTimedOut))
            }
            _ => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn fault(&self, _op: &'static str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_candidates(&self, candidates: &[Candidate]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        for candidate in candidates {
            let existing = candidate.target.as_ref().and_then(|_| {
                inner
                    .candidates
                    .iter()
                    .position(|c| c.target == candidate.target && c.suite == candidate.suite)
            });
            match existing {
                Some(idx) => inner.candidates[idx] = candidate.clone(),
                None => inner.candidates.push(candidate.clone()),
            }
        }
        Ok(candidates.len())
    }

    async fn list_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.inner.lock().await.candidates.clone())
    }

    async fn remove_candidate(&self, key: &RunKey) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.candidates.len();
        inner.candidates.retain(|c| {
            !(c.target.as_deref() == Some(key.target.as_str()) && c.suite == key.suite)
        });
        Ok(inner.candidates.len() != before)
    }

    async fn get_target_state(&self, key: &RunKey) -> Result<Option<TargetState>, StoreError> {
        Ok(self.inner.lock().await.targets.get(key).cloned())
    }

    async fn list_target_states(&self) -> Result<Vec<TargetState>, StoreError> {
        Ok(self.inner.lock().await.targets.values().cloned().collect())
    }

    async fn touch_target(&self, key: &RunKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .targets
            .entry(key.clone())
            .or_insert_with(|| TargetState::new(key.clone()));
        state.last_attempt = state.last_attempt.max(Some(at));
        Ok(())
    }

    async fn record_run(
        &self,
        run: &Run,
        blocked_fingerprint: Option<&str>,
    ) -> Result<(), StoreError> {
        self.fault("record_run")?;
        let mut inner = self.inner.lock().await;
        if inner.runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::DuplicateRun(run.id));
        }

        let state = inner
            .targets
            .entry(run.key.clone())
            .or_insert_with(|| TargetState::new(run.key.clone()));
        state.last_attempt = state.last_attempt.max(Some(run.finished_at));
        state.last_duration_secs = Some(run.duration_secs());
        match &run.outcome {
            RunOutcome::Success => {
                state.attempts += 1;
                state.successes += 1;
                state.last_success = Some(run.finished_at);
                state.blocked_fingerprint = None;
            }
            RunOutcome::Failed { .. } => {
                state.attempts += 1;
                if let Some(fp) = blocked_fingerprint {
                    state.blocked_fingerprint = Some(fp.to_string());
                }
            }
            RunOutcome::Cancelled { .. } => {}
        }

        inner.runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .runs
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_runs(&self, key: Option<&RunKey>, limit: usize) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<Run> = inner
            .runs
            .iter()
            .filter(|r| key.map_or(true, |k| &r.key == k))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_publish_candidates(
        &self,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<Run> = inner
            .runs
            .iter()
            .filter(|r| r.is_publishable())
            .filter(|r| after.map_or(true, |cursor| (r.finished_at, r.id) > cursor))
            .filter(|r| {
                inner
                    .publish
                    .get(&r.id)
                    .map_or(true, |p| p.status == PublishStatus::RateLimited)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| (a.finished_at, a.id).cmp(&(b.finished_at, b.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn get_policy(&self, maintainer: &str) -> Result<Option<PublishPolicy>, StoreError> {
        self.fault("get_policy")?;
        Ok(self.inner.lock().await.policies.get(maintainer).cloned())
    }

    async fn list_policies(&self) -> Result<Vec<PublishPolicy>, StoreError> {
        Ok(self.inner.lock().await.policies.values().cloned().collect())
    }

    async fn set_max_open(
        &self,
        maintainer: &str,
        max_open: Option<u32>,
    ) -> Result<PublishPolicy, StoreError> {
        let mut inner = self.inner.lock().await;
        let policy = inner
            .policies
            .entry(maintainer.to_string())
            .or_insert_with(|| PublishPolicy::new(maintainer));
        policy.max_open = max_open;
        Ok(policy.clone())
    }

    async fn try_reserve_slot(
        &self,
        maintainer: &str,
        limit: Option<u32>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let policy = inner
            .policies
            .entry(maintainer.to_string())
            .or_insert_with(|| PublishPolicy::new(maintainer));
        if limit.is_some_and(|l| policy.open_proposals >= l) {
            return Ok(false);
        }
        policy.open_proposals += 1;
        Ok(true)
    }

    async fn release_slot(&self, maintainer: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(policy) = inner.policies.get_mut(maintainer) {
            policy.open_proposals = policy.open_proposals.saturating_sub(1);
        }
        Ok(())
    }

    async fn try_claim_publish(&self, run: &Run) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.publish.get_mut(&run.id) {
            Some(record) if record.status == PublishStatus::RateLimited => {
                record.status = PublishStatus::Publishing;
                record.reason = None;
                record.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                inner.publish.insert(
                    run.id,
                    PublishRecord {
                        run_id: run.id,
                        key: run.key.clone(),
                        maintainer: run.maintainer.clone(),
                        mode: None,
                        status: PublishStatus::Publishing,
                        reason: None,
                        proposal_id: None,
                        proposal_status: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn finish_publish(&self, record: &PublishRecord) -> Result<(), StoreError> {
        self.fault("finish_publish")?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.publish.get_mut(&record.run_id) {
            let created_at = existing.created_at;
            *existing = record.clone();
            existing.created_at = created_at;
        }
        Ok(())
    }

    async fn get_publish_record(&self, run_id: Uuid) -> Result<Option<PublishRecord>, StoreError> {
        Ok(self.inner.lock().await.publish.get(&run_id).cloned())
    }

    async fn list_open_proposals(&self) -> Result<Vec<PublishRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut open: Vec<PublishRecord> = inner
            .publish
            .values()
            .filter(|p| {
                p.status == PublishStatus::Published
                    && p.proposal_status == Some(ProposalStatus::Open)
            })
            .cloned()
            .collect();
        open.sort_by_key(|p| p.created_at);
        Ok(open)
    }

    async fn find_proposal(&self, proposal_id: &str) -> Result<Option<PublishRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .publish
            .values()
            .find(|p| p.proposal_id.as_deref() == Some(proposal_id))
            .cloned())
    }

    async fn close_proposal(
        &self,
        run_id: Uuid,
        status: ProposalStatus,
    ) -> Result<bool, StoreError> {
        if status == ProposalStatus::Open {
            return Ok(false);
        }

        let mut inner = self.inner.lock().await;
        let maintainer = match inner.publish.get_mut(&run_id) {
            Some(record) if record.proposal_status == Some(ProposalStatus::Open) => {
                record.proposal_status = Some(status);
                record.updated_at = Utc::now();
                record.maintainer.clone()
            }
            _ => return Ok(false),
        };

        if let Some(policy) = inner.policies.get_mut(&maintainer) {
            policy.open_proposals = policy.open_proposals.saturating_sub(1);
            if status == ProposalStatus::Merged {
                policy.merged_proposals += 1;
            }
        }
        Ok(true)
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.inner.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|e| run_id.is_none() || e.run_id == run_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_reserve_slot("m", Some(3)).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        let policy = store.get_policy("m").await.unwrap().unwrap();
        assert_eq!(policy.open_proposals, 3);
    }

    #[tokio::test]
    async fn test_malformed_candidates_are_kept() {
        let store = MemoryStore::new();
        let mut bad = Candidate::new("x", "s");
        bad.target = None;
        store.upsert_candidates(&[bad.clone(), bad]).await.unwrap();
        assert_eq!(store.list_candidates().await.unwrap().len(), 2);
    }
}
