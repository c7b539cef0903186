//! Database schema for the SQLite storage backend.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch and
//! structured values (outcomes, contexts, change descriptions) as JSON text.

/// Candidates imported from external sources.
///
/// `target` is nullable so malformed imports are kept and reported by the
/// scheduler instead of being silently dropped.
pub const CREATE_CANDIDATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS candidates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT,
    suite TEXT NOT NULL,
    maintainer TEXT,
    value REAL NOT NULL DEFAULT 0,
    context TEXT NOT NULL DEFAULT 'null',
    updated_at INTEGER NOT NULL,
    UNIQUE(target, suite)
)
"#;

/// Per-(target, suite) state used for staleness and success likelihood.
pub const CREATE_TARGET_STATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS target_states (
    target TEXT NOT NULL,
    suite TEXT NOT NULL,
    last_attempt INTEGER,
    last_success INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0,
    last_duration_secs REAL,
    blocked_fingerprint TEXT,
    PRIMARY KEY (target, suite)
)
"#;

/// Append-only run history.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    suite TEXT NOT NULL,
    maintainer TEXT NOT NULL,
    worker TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    context TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    outcome_label TEXT NOT NULL,
    disposition TEXT NOT NULL,
    artifacts_ref TEXT,
    log_ref TEXT,
    change TEXT,
    publishable INTEGER NOT NULL DEFAULT 0
)
"#;

/// Per-maintainer publish counters.
pub const CREATE_PUBLISH_POLICIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS publish_policies (
    maintainer TEXT PRIMARY KEY,
    open_proposals INTEGER NOT NULL DEFAULT 0,
    merged_proposals INTEGER NOT NULL DEFAULT 0,
    max_open INTEGER
)
"#;

/// One publish record per run; the primary key makes publishing idempotent.
pub const CREATE_PUBLISH_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS publish_records (
    run_id TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    suite TEXT NOT NULL,
    maintainer TEXT NOT NULL,
    mode TEXT,
    status TEXT NOT NULL,
    reason TEXT,
    proposal_id TEXT,
    proposal_status TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// Audit log of state transitions.
pub const CREATE_AUDIT_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    at INTEGER NOT NULL,
    kind TEXT NOT NULL,
    run_id TEXT,
    target TEXT,
    suite TEXT,
    detail TEXT NOT NULL
)
"#;

/// The work queue. One row per (target, suite).
pub const CREATE_QUEUE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_items (
    id TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    suite TEXT NOT NULL,
    maintainer TEXT NOT NULL,
    host TEXT,
    context TEXT NOT NULL,
    priority REAL NOT NULL,
    staleness_secs INTEGER NOT NULL,
    estimated_duration_secs REAL,
    attempt INTEGER NOT NULL DEFAULT 0,
    earliest_eligible INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    assigned_worker TEXT,
    run_id TEXT,
    requestor TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    UNIQUE(target, suite)
)
"#;

/// Index for run history lookups by key.
pub const CREATE_RUNS_KEY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_key ON runs(target, suite, finished_at)";

/// Index for finding publishable runs.
pub const CREATE_RUNS_PUBLISHABLE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_publishable ON runs(publishable, finished_at)";

/// Index for the queue dispatch order.
pub const CREATE_QUEUE_ORDER_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_queue_order \
     ON queue_items(state, priority DESC, staleness_secs DESC, target, suite)";

/// Index for open proposal refreshes.
pub const CREATE_PUBLISH_PROPOSAL_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_publish_proposal \
     ON publish_records(proposal_status, proposal_id)";

/// Index for audit lookups by run.
pub const CREATE_AUDIT_RUN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_events(run_id, seq)";

/// A named, versioned group of schema statements applied atomically.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Migrations in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "pipeline_state",
        statements: &[
            CREATE_CANDIDATES_TABLE,
            CREATE_TARGET_STATES_TABLE,
            CREATE_RUNS_TABLE,
            CREATE_QUEUE_ITEMS_TABLE,
            CREATE_RUNS_KEY_INDEX,
            CREATE_RUNS_PUBLISHABLE_INDEX,
            CREATE_QUEUE_ORDER_INDEX,
        ],
    },
    Migration {
        version: 2,
        name: "publishing",
        statements: &[
            CREATE_PUBLISH_POLICIES_TABLE,
            CREATE_PUBLISH_RECORDS_TABLE,
            CREATE_PUBLISH_PROPOSAL_INDEX,
        ],
    },
    Migration {
        version: 3,
        name: "audit_log",
        statements: &[CREATE_AUDIT_EVENTS_TABLE, CREATE_AUDIT_RUN_INDEX],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_idempotent() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));

        for statement in MIGRATIONS.iter().flat_map(|m| m.statements) {
            assert!(statement.contains("IF NOT EXISTS"), "{}", statement);
        }
    }
}
