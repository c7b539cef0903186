//! Run records and the outcome types that drive retries.
//!
//! A [`Run`] is written once, when an attempt reaches a terminal state, and
//! is never updated afterwards. What happens next to the queue item is
//! captured by the run's [`Disposition`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::RunKey;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Network or resource error; retried with backoff.
    InfraTransient,
    /// No heartbeat before the lease deadline; retried up to the cap.
    WorkerLost,
    /// The worker determined that no valid change exists.
    LogicFailure,
    /// A change was produced but failed verification.
    BuildFailure,
    /// The external push or propose call failed.
    PublishFailure,
    /// The candidate was rejected at scheduling time.
    MalformedCandidate,
}

impl FailureKind {
    /// Returns the string representation used in storage and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InfraTransient => "infra-transient",
            FailureKind::WorkerLost => "worker-lost",
            FailureKind::LogicFailure => "logic-failure",
            FailureKind::BuildFailure => "build-failure",
            FailureKind::PublishFailure => "publish-failure",
            FailureKind::MalformedCandidate => "malformed-candidate",
        }
    }

    /// Whether a retry could produce a different result.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::InfraTransient | FailureKind::WorkerLost)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single attempt as observed by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RunOutcome {
    /// The worker reported success.
    Success,
    /// The attempt failed.
    Failed { kind: FailureKind, reason: String },
    /// An operator cancelled the run.
    Cancelled { reason: String },
}

impl RunOutcome {
    /// Terminal state label: `succeeded`, `failed`, `lost` or `cancelled`.
    pub fn state(&self) -> &'static str {
        match self {
            RunOutcome::Success => "succeeded",
            RunOutcome::Failed {
                kind: FailureKind::WorkerLost,
                ..
            } => "lost",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled { .. } => "cancelled",
        }
    }

    /// Label used for metrics: `success`, the failure kind, or `cancelled`.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed { kind, .. } => kind.as_str(),
            RunOutcome::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns the failure kind, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RunOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Human-readable reason for the outcome.
    pub fn reason(&self) -> String {
        match self {
            RunOutcome::Success => "run succeeded".to_string(),
            RunOutcome::Failed { kind, reason } => format!("{}: {}", kind, reason),
            RunOutcome::Cancelled { reason } => format!("cancelled: {}", reason),
        }
    }
}

/// What happened to the queue item after a run finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "kebab-case")]
pub enum Disposition {
    /// The run succeeded; the item was removed.
    Completed,
    /// The item was requeued for another attempt.
    Retry {
        /// Attempt number of the next run.
        next_attempt: u32,
        /// The next attempt will not start before this time.
        not_before: DateTime<Utc>,
    },
    /// The failure is deterministic and will not be retried.
    Terminal,
    /// Transient failures exhausted the retry budget.
    FailedPermanent,
    /// The run was cancelled; the target is free for rescheduling.
    Cancelled,
}

impl Disposition {
    /// Whether the queue item was removed.
    pub fn is_final(&self) -> bool {
        !matches!(self, Disposition::Retry { .. })
    }

    /// Whether the candidate should be blocked until its context changes.
    pub fn blocks_candidate(&self) -> bool {
        matches!(self, Disposition::Terminal | Disposition::FailedPermanent)
    }
}

/// A branch produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBranch {
    /// Branch name in the target repository.
    pub name: String,
    /// Revision the change is based on.
    #[serde(default)]
    pub base_revision: Option<String>,
    /// Revision containing the change.
    #[serde(default)]
    pub revision: Option<String>,
}

/// Description of the change a run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescription {
    /// One-line summary, used as the proposal title.
    #[serde(default)]
    pub summary: String,
    /// Diffstat or similar summary of the diff.
    #[serde(default)]
    pub diff_summary: String,
    /// Branches to publish.
    #[serde(default)]
    pub branches: Vec<ResultBranch>,
}

impl ChangeDescription {
    /// A change is empty when it carries neither a diff nor a branch revision.
    pub fn is_empty(&self) -> bool {
        self.diff_summary.trim().is_empty()
            && !self.branches.iter().any(|b| b.revision.is_some())
    }
}

/// Outcome reported by a worker.
///
/// Workers cannot report themselves lost; liveness is judged by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum WorkerOutcome {
    /// The worker produced a result.
    Success,
    /// The worker failed.
    Failure {
        kind: FailureKind,
        #[serde(default)]
        reason: String,
    },
}

/// Terminal message of the worker protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Success or failure.
    #[serde(flatten)]
    pub outcome: WorkerOutcome,
    /// Reference to stored artifacts.
    #[serde(default)]
    pub artifacts_ref: Option<String>,
    /// Reference to stored logs.
    #[serde(default)]
    pub log_ref: Option<String>,
    /// Change produced by a successful run.
    #[serde(default)]
    pub change: Option<ChangeDescription>,
    /// The target host asked us to back off for this many seconds.
    #[serde(default)]
    pub retry_after_secs: Option<u64>,
}

impl WorkerReport {
    /// A successful report carrying a change.
    pub fn success(change: ChangeDescription) -> Self {
        Self {
            outcome: WorkerOutcome::Success,
            artifacts_ref: None,
            log_ref: None,
            change: Some(change),
            retry_after_secs: None,
        }
    }

    /// A failed report.
    pub fn failure(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            outcome: WorkerOutcome::Failure {
                kind,
                reason: reason.into(),
            },
            artifacts_ref: None,
            log_ref: None,
            change: None,
            retry_after_secs: None,
        }
    }

    /// Converts the report into a run outcome.
    ///
    /// A self-reported `worker-lost` is downgraded to `infra-transient`.
    pub fn run_outcome(&self) -> RunOutcome {
        match &self.outcome {
            WorkerOutcome::Success => RunOutcome::Success,
            WorkerOutcome::Failure { kind, reason } => RunOutcome::Failed {
                kind: match kind {
                    FailureKind::WorkerLost => FailureKind::InfraTransient,
                    other => *other,
                },
                reason: reason.clone(),
            },
        }
    }
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: Uuid,
    /// The (target, suite) pair.
    pub key: RunKey,
    /// Maintainer bucket used for publish rate limiting.
    pub maintainer: String,
    /// Name of the worker that executed the run.
    pub worker: String,
    /// Zero-based attempt number for this queue item.
    pub attempt: u32,
    /// Worker context the run was started with.
    pub context: serde_json::Value,
    /// When the run was dispatched.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub finished_at: DateTime<Utc>,
    /// What happened.
    pub outcome: RunOutcome,
    /// What happened to the queue item afterwards.
    pub disposition: Disposition,
    /// Reference to stored artifacts.
    pub artifacts_ref: Option<String>,
    /// Reference to stored logs.
    pub log_ref: Option<String>,
    /// Change produced, for successful runs.
    pub change: Option<ChangeDescription>,
}

impl Run {
    /// Wall-clock duration of the run in seconds.
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Whether the publisher may consider this run.
    pub fn is_publishable(&self) -> bool {
        self.outcome == RunOutcome::Success
            && self.change.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::InfraTransient).unwrap();
        assert_eq!(json, "\"infra-transient\"");
        let kind: FailureKind = serde_json::from_str("\"logic-failure\"").unwrap();
        assert_eq!(kind, FailureKind::LogicFailure);
        assert!(!kind.is_transient());
        assert!(FailureKind::WorkerLost.is_transient());
    }

    #[test]
    fn test_outcome_states() {
        let lost = RunOutcome::Failed {
            kind: FailureKind::WorkerLost,
            reason: "no heartbeat".into(),
        };
        assert_eq!(lost.state(), "lost");
        assert_eq!(lost.label(), "worker-lost");
        assert_eq!(RunOutcome::Success.state(), "succeeded");
        assert!(lost.reason().contains("no heartbeat"));
    }

    #[test]
    fn test_worker_report_wire_format() {
        let report: WorkerReport = serde_json::from_value(json!({
            "status": "failure",
            "kind": "build-failure",
            "reason": "tests failed",
            "log_ref": "logs/1"
        }))
        .unwrap();
        assert_eq!(
            report.run_outcome(),
            RunOutcome::Failed {
                kind: FailureKind::BuildFailure,
                reason: "tests failed".into()
            }
        );
        assert_eq!(report.log_ref.as_deref(), Some("logs/1"));

        let report: WorkerReport = serde_json::from_value(json!({
            "status": "success",
            "change": {"summary": "Fix typo", "diff_summary": "1 file changed"}
        }))
        .unwrap();
        assert_eq!(report.run_outcome(), RunOutcome::Success);
    }

    #[test]
    fn test_self_reported_lost_is_transient() {
        let report = WorkerReport::failure(FailureKind::WorkerLost, "I think I died");
        assert_eq!(
            report.run_outcome().failure_kind(),
            Some(FailureKind::InfraTransient)
        );
    }

    #[test]
    fn test_change_is_empty() {
        assert!(ChangeDescription::default().is_empty());
        let change = ChangeDescription {
            branches: vec![ResultBranch {
                name: "main".into(),
                base_revision: None,
                revision: Some("abc".into()),
            }],
            ..Default::default()
        };
        assert!(!change.is_empty());
    }

    #[test]
    fn test_disposition_flags() {
        assert!(Disposition::Terminal.blocks_candidate());
        assert!(Disposition::FailedPermanent.blocks_candidate());
        assert!(!Disposition::Cancelled.blocks_candidate());
        let retry = Disposition::Retry {
            next_attempt: 1,
            not_before: Utc::now(),
        };
        assert!(!retry.is_final());
    }
}
