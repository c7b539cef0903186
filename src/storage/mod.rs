//! Durable state shared by the scheduler, runner and publisher.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **StateStore**: candidates, target state, run history, publish
//!   policies, publish records and the audit log
//! - **Database**: SQLite connection pool shared with the queue
//! - **Migrations**: schema management and versioning
//!
//! Every operation that reads and then writes a record is a single SQL
//! statement or a transaction scoped to that record. There is no global
//! lock; concurrent cycles see per-record atomic updates.
//!
//! # Usage
//!
//! ```rust,ignore
//! use janitor::storage::{Database, SqliteStore, StateStore};
//!
//! let db = Database::connect("sqlite://janitor.db").await?;
//! db.run_migrations().await?;
//!
//! let store = SqliteStore::new(db.clone());
//! let reserved = store.try_reserve_slot("jane@example.com", Some(3)).await?;
//! ```

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    AuditEvent, Candidate, PublishPolicy, PublishRecord, ProposalStatus, Run, RunKey, TargetState,
};

pub use database::Database;
pub use memory::MemoryStore;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use sqlite::SqliteStore;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query execution failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Runs are append-only; a run id can be recorded once.
    #[error("Run {0} is already recorded")]
    DuplicateRun(Uuid),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Read/write access to the durable pipeline state.
#[async_trait]
pub trait StateStore: Send + Sync {
    // =========================================================================
    // Candidates
    // =========================================================================

    /// Inserts or replaces candidates by (target, suite). Returns the number written.
    async fn upsert_candidates(&self, candidates: &[Candidate]) -> Result<usize, StoreError>;

    /// Lists all candidates, including malformed ones.
    async fn list_candidates(&self) -> Result<Vec<Candidate>, StoreError>;

    /// Removes a candidate. Returns whether it existed.
    async fn remove_candidate(&self, key: &RunKey) -> Result<bool, StoreError>;

    // =========================================================================
    // Target state
    // =========================================================================

    /// Returns the state of a (target, suite) pair.
    async fn get_target_state(&self, key: &RunKey) -> Result<Option<TargetState>, StoreError>;

    /// Lists the state of every (target, suite) pair that was ever attempted.
    async fn list_target_states(&self) -> Result<Vec<TargetState>, StoreError>;

    /// Records a state transition time as the last attempt.
    async fn touch_target(&self, key: &RunKey, at: DateTime<Utc>) -> Result<(), StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    /// Appends a finished run and folds it into the target state.
    ///
    /// `blocked_fingerprint` marks the candidate as blocked until its
    /// context changes. A successful run clears any block.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateRun` if the run id is already recorded.
    async fn record_run(
        &self,
        run: &Run,
        blocked_fingerprint: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Returns a run by id.
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Lists runs, newest first, optionally restricted to one key.
    async fn list_runs(&self, key: Option<&RunKey>, limit: usize) -> Result<Vec<Run>, StoreError>;

    /// Lists publishable runs that have no publish record or were
    /// rate-limited, oldest first.
    ///
    /// `after` is the `(finished_at, id)` of the last run of the previous
    /// page; only runs ordered after it are returned.
    async fn list_publish_candidates(
        &self,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError>;

    // =========================================================================
    // Publish policies
    // =========================================================================

    /// Returns the policy for a maintainer.
    async fn get_policy(&self, maintainer: &str) -> Result<Option<PublishPolicy>, StoreError>;

    /// Lists all policies.
    async fn list_policies(&self) -> Result<Vec<PublishPolicy>, StoreError>;

    /// Sets or clears the per-maintainer maximum.
    async fn set_max_open(
        &self,
        maintainer: &str,
        max_open: Option<u32>,
    ) -> Result<PublishPolicy, StoreError>;

    /// Atomically takes an open-proposal slot if the maintainer is below `limit`.
    ///
    /// `None` means unlimited; the count is still incremented.
    async fn try_reserve_slot(&self, maintainer: &str, limit: Option<u32>)
        -> Result<bool, StoreError>;

    /// Returns a slot taken by `try_reserve_slot`.
    async fn release_slot(&self, maintainer: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Publish records
    // =========================================================================

    /// Claims a run for publishing.
    ///
    /// Succeeds when the run has no publish record or its record is
    /// rate-limited. Any other record means the run was already handled.
    async fn try_claim_publish(&self, run: &Run) -> Result<bool, StoreError>;

    /// Writes the final state of a claimed publish record.
    async fn finish_publish(&self, record: &PublishRecord) -> Result<(), StoreError>;

    /// Returns the publish record of a run.
    async fn get_publish_record(&self, run_id: Uuid) -> Result<Option<PublishRecord>, StoreError>;

    /// Lists records whose proposal is still open.
    async fn list_open_proposals(&self) -> Result<Vec<PublishRecord>, StoreError>;

    /// Finds the record that opened a proposal.
    async fn find_proposal(&self, proposal_id: &str) -> Result<Option<PublishRecord>, StoreError>;

    /// Marks an open proposal merged or closed and frees its slot.
    ///
    /// Returns `false` if the proposal was not open, in which case nothing changes.
    async fn close_proposal(&self, run_id: Uuid, status: ProposalStatus)
        -> Result<bool, StoreError>;

    // =========================================================================
    // Audit log
    // =========================================================================

    /// Appends an audit event.
    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Lists audit events, newest first, optionally for one run.
    async fn list_events(
        &self,
        run_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError>;
}
