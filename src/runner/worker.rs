//! The worker abstraction and its wire messages.
//!
//! A worker executes one assignment at a time per slot and reports back
//! through an event channel:
//!
//! ```text
//! Runner ── start(Assignment) ──► Worker
//!   ▲                               │
//!   └──── started / heartbeat / result ─┘
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{RunKey, WorkerReport};

/// Errors raised by worker implementations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// IO error while talking to the worker.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The assignment could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The worker is not running the given run.
    #[error("Run {0} is not running on this worker")]
    NotRunning(Uuid),
}

/// Work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: Uuid,
    pub target: String,
    pub suite: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Opaque candidate context.
    pub context: serde_json::Value,
    /// Seconds between heartbeats the runner expects.
    pub heartbeat_interval_secs: u64,
}

impl Assignment {
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.target, &self.suite)
    }
}

/// A message from a worker about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerEvent {
    /// The run has started.
    Started,
    /// The run is still making progress.
    Heartbeat,
    /// The run has finished.
    Result { report: WorkerReport },
}

/// A worker event addressed to a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMessage {
    pub run_id: Uuid,
    pub event: WorkerEvent,
}

/// Something that executes assignments.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique worker name, recorded on leases and runs.
    fn name(&self) -> &str;

    /// Suites this worker accepts; `None` accepts all.
    fn suites(&self) -> Option<&HashSet<String>>;

    /// Maximum concurrent runs on this worker.
    fn capacity(&self) -> usize;

    /// Starts an assignment.
    ///
    /// Returns once the worker has accepted the assignment; progress is
    /// reported on `events`.
    async fn start(
        &self,
        assignment: Assignment,
        events: mpsc::Sender<WorkerMessage>,
    ) -> Result<(), WorkerError>;

    /// Asks the worker to stop a run. Best effort.
    async fn cancel(&self, run_id: Uuid) -> Result<(), WorkerError>;
}
