//! Shared data model for the scheduling, dispatch and publish pipeline.
//!
//! ```text
//! Candidate ──► QueueItem ──► Run × N (retries) ──► terminal Run ──► PublishRecord
//!                                   │
//!                                   └─► TargetState (staleness, success rate)
//! ```

pub mod audit;
pub mod candidate;
pub mod policy;
pub mod run;
pub mod target;

pub use audit::{AuditEvent, AuditKind};
pub use candidate::{fingerprint, Candidate};
pub use policy::{PublishMode, PublishPolicy, PublishRecord, PublishStatus, ProposalStatus};
pub use run::{
    ChangeDescription, Disposition, FailureKind, ResultBranch, Run, RunOutcome, WorkerOutcome,
    WorkerReport,
};
pub use target::{target_host, RunKey, TargetState};
