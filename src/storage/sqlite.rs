//! SQLite implementation of [`StateStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::model::{
    AuditEvent, Candidate, PublishPolicy, PublishRecord, PublishStatus, ProposalStatus, Run,
    RunKey, RunOutcome, TargetState,
};

use super::database::{from_millis, from_millis_opt, to_millis, Database};
use super::{StateStore, StoreError};

/// State store backed by the shared SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Creates a store on an already migrated database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.db.pool()
    }
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("invalid uuid '{}': {}", raw, e)))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn opt_u32(value: Option<i64>) -> Option<u32> {
    value.map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
}

fn candidate_from_row(row: &SqliteRow) -> Result<Candidate, StoreError> {
    let context: String = row.try_get("context")?;
    Ok(Candidate {
        target: row.try_get("target")?,
        suite: row.try_get("suite")?,
        maintainer: row.try_get("maintainer")?,
        value: row.try_get("value")?,
        context: serde_json::from_str(&context)?,
    })
}

fn target_state_from_row(row: &SqliteRow) -> Result<TargetState, StoreError> {
    Ok(TargetState {
        key: RunKey::new(
            row.try_get::<String, _>("target")?,
            row.try_get::<String, _>("suite")?,
        ),
        last_attempt: from_millis_opt(row.try_get("last_attempt")?)?,
        last_success: from_millis_opt(row.try_get("last_success")?)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        successes: row.try_get::<i64, _>("successes")? as u32,
        last_duration_secs: row.try_get("last_duration_secs")?,
        blocked_fingerprint: row.try_get("blocked_fingerprint")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let id: String = row.try_get("id")?;
    let context: String = row.try_get("context")?;
    let outcome: String = row.try_get("outcome")?;
    let disposition: String = row.try_get("disposition")?;
    let change: Option<String> = row.try_get("change")?;

    Ok(Run {
        id: parse_uuid(&id)?,
        key: RunKey::new(
            row.try_get::<String, _>("target")?,
            row.try_get::<String, _>("suite")?,
        ),
        maintainer: row.try_get("maintainer")?,
        worker: row.try_get("worker")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        context: serde_json::from_str(&context)?,
        started_at: from_millis(row.try_get("started_at")?)?,
        finished_at: from_millis(row.try_get("finished_at")?)?,
        outcome: serde_json::from_str(&outcome)?,
        disposition: serde_json::from_str(&disposition)?,
        artifacts_ref: row.try_get("artifacts_ref")?,
        log_ref: row.try_get("log_ref")?,
        change: change.map(|c| serde_json::from_str(&c)).transpose()?,
    })
}

fn policy_from_row(row: &SqliteRow) -> Result<PublishPolicy, StoreError> {
    Ok(PublishPolicy {
        maintainer: row.try_get("maintainer")?,
        open_proposals: row.try_get::<i64, _>("open_proposals")? as u32,
        merged_proposals: row.try_get::<i64, _>("merged_proposals")? as u32,
        max_open: opt_u32(row.try_get("max_open")?),
    })
}

fn publish_record_from_row(row: &SqliteRow) -> Result<PublishRecord, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    let mode: Option<String> = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let proposal_status: Option<String> = row.try_get("proposal_status")?;

    Ok(PublishRecord {
        run_id: parse_uuid(&run_id)?,
        key: RunKey::new(
            row.try_get::<String, _>("target")?,
            row.try_get::<String, _>("suite")?,
        ),
        maintainer: row.try_get("maintainer")?,
        mode: mode.as_deref().map(parse_enum).transpose()?,
        status: parse_enum(&status)?,
        reason: row.try_get("reason")?,
        proposal_id: row.try_get("proposal_id")?,
        proposal_status: proposal_status.as_deref().map(parse_enum).transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<AuditEvent, StoreError> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let run_id: Option<String> = row.try_get("run_id")?;
    let target: Option<String> = row.try_get("target")?;
    let suite: Option<String> = row.try_get("suite")?;

    Ok(AuditEvent {
        id: parse_uuid(&id)?,
        at: from_millis(row.try_get("at")?)?,
        kind: parse_enum(&kind)?,
        run_id: run_id.as_deref().map(parse_uuid).transpose()?,
        key: target.zip(suite).map(|(t, s)| RunKey::new(t, s)),
        detail: row.try_get("detail")?,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    // =========================================================================
    // Candidates
    // =========================================================================

    async fn upsert_candidates(&self, candidates: &[Candidate]) -> Result<usize, StoreError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool().begin().await?;

        for candidate in candidates {
            sqlx::query(
                r#"
                INSERT INTO candidates (target, suite, maintainer, value, context, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (target, suite) DO UPDATE SET
                    maintainer = excluded.maintainer,
                    value = excluded.value,
                    context = excluded.context,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&candidate.target)
            .bind(&candidate.suite)
            .bind(&candidate.maintainer)
            .bind(candidate.value)
            .bind(candidate.context.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(candidates.len())
    }

    async fn list_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT target, suite, maintainer, value, context FROM candidates ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(candidate_from_row).collect()
    }

    async fn remove_candidate(&self, key: &RunKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM candidates WHERE target = ? AND suite = ?")
            .bind(&key.target)
            .bind(&key.suite)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Target state
    // =========================================================================

    async fn get_target_state(&self, key: &RunKey) -> Result<Option<TargetState>, StoreError> {
        let row = sqlx::query("SELECT * FROM target_states WHERE target = ? AND suite = ?")
            .bind(&key.target)
            .bind(&key.suite)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(target_state_from_row).transpose()
    }

    async fn list_target_states(&self) -> Result<Vec<TargetState>, StoreError> {
        let rows = sqlx::query("SELECT * FROM target_states ORDER BY target, suite")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(target_state_from_row).collect()
    }

    async fn touch_target(&self, key: &RunKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO target_states (target, suite, last_attempt)
            VALUES (?, ?, ?)
            ON CONFLICT (target, suite) DO UPDATE SET
                last_attempt = MAX(COALESCE(target_states.last_attempt, 0), excluded.last_attempt)
            "#,
        )
        .bind(&key.target)
        .bind(&key.suite)
        .bind(to_millis(at))
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn record_run(
        &self,
        run: &Run,
        blocked_fingerprint: Option<&str>,
    ) -> Result<(), StoreError> {
        let succeeded = run.outcome == RunOutcome::Success;
        let counted = !matches!(run.outcome, RunOutcome::Cancelled { .. });
        let change = run.change.as_ref().map(serde_json::to_string).transpose()?;

        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (
                id, target, suite, maintainer, worker, attempt, context,
                started_at, finished_at, outcome, outcome_label, disposition,
                artifacts_ref, log_ref, change, publishable
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.key.target)
        .bind(&run.key.suite)
        .bind(&run.maintainer)
        .bind(&run.worker)
        .bind(i64::from(run.attempt))
        .bind(run.context.to_string())
        .bind(to_millis(run.started_at))
        .bind(to_millis(run.finished_at))
        .bind(serde_json::to_string(&run.outcome)?)
        .bind(run.outcome.label())
        .bind(serde_json::to_string(&run.disposition)?)
        .bind(&run.artifacts_ref)
        .bind(&run.log_ref)
        .bind(change)
        .bind(run.is_publishable())
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return Err(StoreError::DuplicateRun(run.id));
                }
            }
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT INTO target_states (
                target, suite, last_attempt, last_success, attempts, successes,
                last_duration_secs, blocked_fingerprint
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (target, suite) DO UPDATE SET
                last_attempt = MAX(COALESCE(target_states.last_attempt, 0), excluded.last_attempt),
                last_success = COALESCE(excluded.last_success, target_states.last_success),
                attempts = target_states.attempts + excluded.attempts,
                successes = target_states.successes + excluded.successes,
                last_duration_secs = excluded.last_duration_secs,
                blocked_fingerprint = CASE
                    WHEN excluded.successes > 0 THEN NULL
                    ELSE COALESCE(excluded.blocked_fingerprint, target_states.blocked_fingerprint)
                END
            "#,
        )
        .bind(&run.key.target)
        .bind(&run.key.suite)
        .bind(to_millis(run.finished_at))
        .bind(succeeded.then(|| to_millis(run.finished_at)))
        .bind(i64::from(counted))
        .bind(i64::from(succeeded))
        .bind(run.duration_secs())
        .bind(blocked_fingerprint)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, key: Option<&RunKey>, limit: usize) -> Result<Vec<Run>, StoreError> {
        let rows = match key {
            Some(key) => {
                sqlx::query(
                    "SELECT * FROM runs WHERE target = ? AND suite = ? \
                     ORDER BY finished_at DESC LIMIT ?",
                )
                .bind(&key.target)
                .bind(&key.suite)
                .bind(limit as i64)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY finished_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(self.pool())
                    .await?
            }
        };

        rows.iter().map(run_from_row).collect()
    }

    async fn list_publish_candidates(
        &self,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let (after_at, after_id) = match after {
            Some((at, id)) => (to_millis(at), id.to_string()),
            None => (i64::MIN, String::new()),
        };
        let rows = sqlx::query(
            r#"
            SELECT r.* FROM runs r
            LEFT JOIN publish_records p ON p.run_id = r.id
            WHERE r.publishable = 1 AND (p.run_id IS NULL OR p.status = 'rate-limited')
              AND (r.finished_at > ? OR (r.finished_at = ? AND r.id > ?))
            ORDER BY r.finished_at ASC, r.id ASC
            LIMIT ?
            "#,
        )
        .bind(after_at)
        .bind(after_at)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    // =========================================================================
    // Publish policies
    // =========================================================================

    async fn get_policy(&self, maintainer: &str) -> Result<Option<PublishPolicy>, StoreError> {
        let row = sqlx::query("SELECT * FROM publish_policies WHERE maintainer = ?")
            .bind(maintainer)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    async fn list_policies(&self) -> Result<Vec<PublishPolicy>, StoreError> {
        let rows = sqlx::query("SELECT * FROM publish_policies ORDER BY maintainer")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(policy_from_row).collect()
    }

    async fn set_max_open(
        &self,
        maintainer: &str,
        max_open: Option<u32>,
    ) -> Result<PublishPolicy, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO publish_policies (maintainer, max_open) VALUES (?, ?)
            ON CONFLICT (maintainer) DO UPDATE SET max_open = excluded.max_open
            RETURNING *
            "#,
        )
        .bind(maintainer)
        .bind(max_open.map(i64::from))
        .fetch_one(self.pool())
        .await?;

        policy_from_row(&row)
    }

    async fn try_reserve_slot(
        &self,
        maintainer: &str,
        limit: Option<u32>,
    ) -> Result<bool, StoreError> {
        sqlx::query("INSERT INTO publish_policies (maintainer) VALUES (?) ON CONFLICT DO NOTHING")
            .bind(maintainer)
            .execute(self.pool())
            .await?;

        let limit = limit.map(i64::from);
        let result = sqlx::query(
            r#"
            UPDATE publish_policies SET open_proposals = open_proposals + 1
            WHERE maintainer = ? AND (? IS NULL OR open_proposals < ?)
            "#,
        )
        .bind(maintainer)
        .bind(limit)
        .bind(limit)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_slot(&self, maintainer: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE publish_policies SET open_proposals = MAX(open_proposals - 1, 0) \
             WHERE maintainer = ?",
        )
        .bind(maintainer)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // =========================================================================
    // Publish records
    // =========================================================================

    async fn try_claim_publish(&self, run: &Run) -> Result<bool, StoreError> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO publish_records (
                run_id, target, suite, maintainer, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'publishing', ?, ?)
            ON CONFLICT (run_id) DO UPDATE SET
                status = 'publishing',
                reason = NULL,
                updated_at = excluded.updated_at
            WHERE publish_records.status = 'rate-limited'
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.key.target)
        .bind(&run.key.suite)
        .bind(&run.maintainer)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_publish(&self, record: &PublishRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE publish_records SET
                mode = ?, status = ?, reason = ?, proposal_id = ?,
                proposal_status = ?, updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(record.mode.map(|m| m.as_str()))
        .bind(record.status.as_str())
        .bind(&record.reason)
        .bind(&record.proposal_id)
        .bind(record.proposal_status.map(|s| s.as_str()))
        .bind(to_millis(record.updated_at))
        .bind(record.run_id.to_string())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn get_publish_record(&self, run_id: Uuid) -> Result<Option<PublishRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM publish_records WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(publish_record_from_row).transpose()
    }

    async fn list_open_proposals(&self) -> Result<Vec<PublishRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM publish_records WHERE status = ? AND proposal_status = 'open' \
             ORDER BY created_at",
        )
        .bind(PublishStatus::Published.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(publish_record_from_row).collect()
    }

    async fn find_proposal(&self, proposal_id: &str) -> Result<Option<PublishRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM publish_records WHERE proposal_id = ?")
            .bind(proposal_id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(publish_record_from_row).transpose()
    }

    async fn close_proposal(
        &self,
        run_id: Uuid,
        status: ProposalStatus,
    ) -> Result<bool, StoreError> {
        if status == ProposalStatus::Open {
            return Ok(false);
        }

        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE publish_records SET proposal_status = ?, updated_at = ? \
             WHERE run_id = ? AND proposal_status = 'open'",
        )
        .bind(status.as_str())
        .bind(to_millis(Utc::now()))
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let (maintainer,): (String,) =
            sqlx::query_as("SELECT maintainer FROM publish_records WHERE run_id = ?")
                .bind(run_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            UPDATE publish_policies SET
                open_proposals = MAX(open_proposals - 1, 0),
                merged_proposals = merged_proposals + ?
            WHERE maintainer = ?
            "#,
        )
        .bind(i64::from(status == ProposalStatus::Merged))
        .bind(&maintainer)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events (id, at, kind, run_id, target, suite, detail) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(to_millis(event.at))
        .bind(event.kind.as_str())
        .bind(event.run_id.map(|id| id.to_string()))
        .bind(event.key.as_ref().map(|k| k.target.as_str()))
        .bind(event.key.as_ref().map(|k| k.suite.as_str()))
        .bind(&event.detail)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        run_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = match run_id {
            Some(run_id) => {
                sqlx::query("SELECT * FROM audit_events WHERE run_id = ? ORDER BY seq DESC LIMIT ?")
                    .bind(run_id.to_string())
                    .bind(limit as i64)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM audit_events ORDER BY seq DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(self.pool())
                    .await?
            }
        };

        rows.iter().map(event_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AuditKind, ChangeDescription, Disposition, FailureKind, PublishMode,
    };
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> SqliteStore {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        SqliteStore::new(db)
    }

    fn run(key: &RunKey, outcome: RunOutcome, change: Option<ChangeDescription>) -> Run {
        let finished = Utc::now();
        Run {
            id: Uuid::new_v4(),
            key: key.clone(),
            maintainer: "jane@example.com".into(),
            worker: "local".into(),
            attempt: 0,
            context: json!({"tag": "1.0"}),
            started_at: finished - Duration::seconds(90),
            finished_at: finished,
            outcome,
            disposition: Disposition::Completed,
            artifacts_ref: Some("artifacts/1".into()),
            log_ref: None,
            change,
        }
    }

    fn change() -> ChangeDescription {
        ChangeDescription {
            summary: "Fix typo".into(),
            diff_summary: "1 file changed".into(),
            branches: vec![],
        }
    }

    #[tokio::test]
    async fn test_candidates_upsert_and_malformed() {
        let store = store().await;
        let good = Candidate::new("https://example.com/a", "s1").with_value(2.0);
        let mut bad = Candidate::new("", "s1");
        bad.target = None;

        store.upsert_candidates(&[good.clone(), bad]).await.unwrap();
        store
            .upsert_candidates(&[good.clone().with_value(5.0)])
            .await
            .unwrap();

        let all = store.list_candidates().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, 5.0);
        assert!(all[1].target.is_none());

        let key = good.key().unwrap();
        assert!(store.remove_candidate(&key).await.unwrap());
        assert!(!store.remove_candidate(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_run_is_append_only_and_updates_state() {
        let store = store().await;
        let key = RunKey::new("https://example.com/a", "s1");
        let failed = run(
            &key,
            RunOutcome::Failed {
                kind: FailureKind::LogicFailure,
                reason: "nothing to do".into(),
            },
            None,
        );

        store.record_run(&failed, Some("fp-1")).await.unwrap();
        let err = store.record_run(&failed, None).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRun(id) if id == failed.id));

        let state = store.get_target_state(&key).await.unwrap().unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(state.successes, 0);
        assert_eq!(state.blocked_fingerprint.as_deref(), Some("fp-1"));
        assert!((state.last_duration_secs.unwrap() - 90.0).abs() < 1.0);

        let ok = run(&key, RunOutcome::Success, Some(change()));
        store.record_run(&ok, None).await.unwrap();
        let state = store.get_target_state(&key).await.unwrap().unwrap();
        assert_eq!(state.attempts, 2);
        assert_eq!(state.successes, 1);
        assert!(state.blocked_fingerprint.is_none());
        assert!(state.last_success.is_some());

        let loaded = store.get_run(ok.id).await.unwrap().unwrap();
        assert_eq!(loaded.outcome, RunOutcome::Success);
        assert_eq!(loaded.change, Some(change()));
        assert_eq!(store.list_runs(Some(&key), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_touch_target_keeps_latest() {
        let store = store().await;
        let key = RunKey::new("t", "s");
        let now = Utc::now();
        store.touch_target(&key, now).await.unwrap();
        store.touch_target(&key, now - Duration::hours(1)).await.unwrap();
        let state = store.get_target_state(&key).await.unwrap().unwrap();
        assert_eq!(
            state.last_attempt.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
        assert_eq!(state.attempts, 0);
    }

    #[tokio::test]
    async fn test_reserve_slot_respects_limit() {
        let store = store().await;
        assert!(store.try_reserve_slot("m", Some(2)).await.unwrap());
        assert!(store.try_reserve_slot("m", Some(2)).await.unwrap());
        assert!(!store.try_reserve_slot("m", Some(2)).await.unwrap());

        store.release_slot("m").await.unwrap();
        assert!(store.try_reserve_slot("m", Some(2)).await.unwrap());

        assert!(store.try_reserve_slot("m", None).await.unwrap());
        let policy = store.get_policy("m").await.unwrap().unwrap();
        assert_eq!(policy.open_proposals, 3);

        let policy = store.set_max_open("m", Some(7)).await.unwrap();
        assert_eq!(policy.max_open, Some(7));
        assert_eq!(policy.open_proposals, 3);
    }

    #[tokio::test]
    async fn test_publish_claim_is_idempotent() {
        let store = store().await;
        let key = RunKey::new("t", "s");
        let r = run(&key, RunOutcome::Success, Some(change()));
        store.record_run(&r, None).await.unwrap();
        assert_eq!(store.list_publish_candidates(None, 10).await.unwrap().len(), 1);

        assert!(store.try_claim_publish(&r).await.unwrap());
        assert!(!store.try_claim_publish(&r).await.unwrap());
        assert!(store.list_publish_candidates(None, 10).await.unwrap().is_empty());

        let now = Utc::now();
        let mut record = store.get_publish_record(r.id).await.unwrap().unwrap();
        record.status = PublishStatus::RateLimited;
        record.reason = Some("at quota".into());
        record.updated_at = now;
        store.finish_publish(&record).await.unwrap();

        // Rate-limited runs come back and can be claimed again.
        assert_eq!(store.list_publish_candidates(None, 10).await.unwrap().len(), 1);
        assert!(store.try_claim_publish(&r).await.unwrap());

        record.status = PublishStatus::Published;
        record.mode = Some(PublishMode::Propose);
        record.reason = None;
        record.proposal_id = Some("pr-1".into());
        record.proposal_status = Some(ProposalStatus::Open);
        store.finish_publish(&record).await.unwrap();
        assert!(!store.try_claim_publish(&r).await.unwrap());
        assert_eq!(store.list_open_proposals().await.unwrap().len(), 1);
        assert_eq!(
            store.find_proposal("pr-1").await.unwrap().unwrap().run_id,
            r.id
        );
    }

    #[tokio::test]
    async fn test_close_proposal_frees_slot_once() {
        let store = store().await;
        let key = RunKey::new("t", "s");
        let r = run(&key, RunOutcome::Success, Some(change()));
        store.record_run(&r, None).await.unwrap();
        assert!(store.try_claim_publish(&r).await.unwrap());
        assert!(store
            .try_reserve_slot(&r.maintainer, Some(1))
            .await
            .unwrap());

        let now = Utc::now();
        let mut record = store.get_publish_record(r.id).await.unwrap().unwrap();
        record.status = PublishStatus::Published;
        record.proposal_id = Some("pr-9".into());
        record.proposal_status = Some(ProposalStatus::Open);
        record.updated_at = now;
        store.finish_publish(&record).await.unwrap();

        assert!(store
            .close_proposal(r.id, ProposalStatus::Merged)
            .await
            .unwrap());
        assert!(!store
            .close_proposal(r.id, ProposalStatus::Closed)
            .await
            .unwrap());

        let policy = store.get_policy(&r.maintainer).await.unwrap().unwrap();
        assert_eq!(policy.open_proposals, 0);
        assert_eq!(policy.merged_proposals, 1);
    }

    #[tokio::test]
    async fn test_audit_events() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        let key = RunKey::new("t", "s");
        store
            .append_event(
                &AuditEvent::new(AuditKind::Assigned, "assigned to local")
                    .with_run(run_id)
                    .with_key(key.clone()),
            )
            .await
            .unwrap();
        store
            .append_event(&AuditEvent::new(AuditKind::Running, "started").with_run(run_id))
            .await
            .unwrap();
        store
            .append_event(&AuditEvent::new(AuditKind::MalformedCandidate, "no target"))
            .await
            .unwrap();

        let events = store.list_events(Some(run_id), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditKind::Running);
        assert_eq!(events[1].key, Some(key));
        assert_eq!(store.list_events(None, 10).await.unwrap().len(), 3);
    }
}
