//! Publish policies and publish records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::RunKey;

/// Per-maintainer publish state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPolicy {
    /// Maintainer (rate-limit bucket) this policy applies to.
    pub maintainer: String,
    /// Number of proposals currently open.
    pub open_proposals: u32,
    /// Number of proposals that were merged.
    pub merged_proposals: u32,
    /// Per-maintainer override of the configured maximum.
    pub max_open: Option<u32>,
}

impl PublishPolicy {
    /// Creates an empty policy for a maintainer.
    pub fn new(maintainer: impl Into<String>) -> Self {
        Self {
            maintainer: maintainer.into(),
            open_proposals: 0,
            merged_proposals: 0,
            max_open: None,
        }
    }
}

/// How a change is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
    /// Never publish.
    Skip,
    /// Build only; keep the result but never publish it.
    BuildOnly,
    /// Push directly to the target branch.
    Push,
    /// Open a proposal for review.
    Propose,
    /// Push, falling back to a proposal when pushing is not permitted.
    AttemptPush,
}

impl PublishMode {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishMode::Skip => "skip",
            PublishMode::BuildOnly => "build-only",
            PublishMode::Push => "push",
            PublishMode::Propose => "propose",
            PublishMode::AttemptPush => "attempt-push",
        }
    }

    /// Whether this mode ever produces an external side effect.
    pub fn publishes(&self) -> bool {
        !matches!(self, PublishMode::Skip | PublishMode::BuildOnly)
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(PublishMode::Skip),
            "build-only" => Ok(PublishMode::BuildOnly),
            "push" => Ok(PublishMode::Push),
            "propose" => Ok(PublishMode::Propose),
            "attempt-push" => Ok(PublishMode::AttemptPush),
            other => Err(format!("unknown publish mode: {}", other)),
        }
    }
}

/// State of a publish attempt for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishStatus {
    /// Claimed by a publisher; the action is in flight.
    Publishing,
    /// The change was pushed or proposed.
    Published,
    /// Deferred because the maintainer was at quota.
    RateLimited,
    /// Not published; see the reason.
    Skipped,
}

impl PublishStatus {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Publishing => "publishing",
            PublishStatus::Published => "published",
            PublishStatus::RateLimited => "rate-limited",
            PublishStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for PublishStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publishing" => Ok(PublishStatus::Publishing),
            "published" => Ok(PublishStatus::Published),
            "rate-limited" => Ok(PublishStatus::RateLimited),
            "skipped" => Ok(PublishStatus::Skipped),
            other => Err(format!("unknown publish status: {}", other)),
        }
    }
}

/// Status of an opened proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    Open,
    Merged,
    Closed,
}

impl ProposalStatus {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Open => "open",
            ProposalStatus::Merged => "merged",
            ProposalStatus::Closed => "closed",
        }
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ProposalStatus::Open),
            "merged" => Ok(ProposalStatus::Merged),
            "closed" => Ok(ProposalStatus::Closed),
            other => Err(format!("unknown proposal status: {}", other)),
        }
    }
}

/// Publish attempt for a run. There is at most one record per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    /// Run being published.
    pub run_id: Uuid,
    /// The (target, suite) pair of the run.
    pub key: RunKey,
    /// Maintainer bucket charged for the publish.
    pub maintainer: String,
    /// Mode chosen for the run.
    pub mode: Option<PublishMode>,
    /// Current status.
    pub status: PublishStatus,
    /// Why the run was skipped or rate-limited.
    pub reason: Option<String>,
    /// Proposal identifier, when a proposal was opened.
    pub proposal_id: Option<String>,
    /// Last known proposal status.
    pub proposal_status: Option<ProposalStatus>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}
