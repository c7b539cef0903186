//! Audit events recorded on every state transition.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::RunKey;

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Lost,
    Cancelled,
    Requeued,
    Recovered,
    MalformedCandidate,
    Published,
    RateLimited,
    PublishSkipped,
    ProposalClosed,
}

impl AuditKind {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Queued => "queued",
            AuditKind::Assigned => "assigned",
            AuditKind::Running => "running",
            AuditKind::Succeeded => "succeeded",
            AuditKind::Failed => "failed",
            AuditKind::Lost => "lost",
            AuditKind::Cancelled => "cancelled",
            AuditKind::Requeued => "requeued",
            AuditKind::Recovered => "recovered",
            AuditKind::MalformedCandidate => "malformed-candidate",
            AuditKind::Published => "published",
            AuditKind::RateLimited => "rate-limited",
            AuditKind::PublishSkipped => "publish-skipped",
            AuditKind::ProposalClosed => "proposal-closed",
        }
    }

    /// Maps a terminal run state label to its audit kind.
    pub fn for_run_state(state: &str) -> Self {
        match state {
            "succeeded" => AuditKind::Succeeded,
            "lost" => AuditKind::Lost,
            "cancelled" => AuditKind::Cancelled,
            _ => AuditKind::Failed,
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown audit kind: {}", s))
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub id: Uuid,
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// What happened.
    pub kind: AuditKind,
    /// Run the event refers to, if any.
    pub run_id: Option<Uuid>,
    /// (target, suite) the event refers to, if any.
    pub key: Option<RunKey>,
    /// Human-readable detail.
    pub detail: String,
}

impl AuditEvent {
    /// Creates an event stamped with the current time.
    pub fn new(kind: AuditKind, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            kind,
            run_id: None,
            key: None,
            detail: detail.into(),
        }
    }

    /// Attaches a run id.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attaches a (target, suite) key.
    pub fn with_key(mut self, key: RunKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Overrides the timestamp.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}
