//! The external publish action.
//!
//! The publisher never talks to a VCS host itself. It calls a
//! [`PublishAction`], normally a configured command that knows how to push
//! branches and open proposals on the host of a target.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::model::{ProposalStatus, Run};

/// Errors from a publish action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The host refused the push; proposing may still work.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The action failed.
    #[error("Publish action failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid action response: {0}")]
    Json(#[from] serde_json::Error),

    /// The action did not finish in time.
    #[error("Publish action timed out after {0}s")]
    Timeout(u64),
}

/// Pushes and proposes changes on behalf of the publisher.
#[async_trait]
pub trait PublishAction: Send + Sync {
    /// Pushes the run's change directly to the target.
    async fn push(&self, run: &Run) -> Result<(), ActionError>;

    /// Opens a proposal for review and returns its identifier.
    async fn propose(&self, run: &Run) -> Result<String, ActionError>;

    /// Current status of a previously opened proposal.
    async fn proposal_status(&self, proposal_id: &str) -> Result<ProposalStatus, ActionError>;
}

/// Request written to the action command's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum ActionRequest<'a> {
    Push { run: &'a Run, dry_run: bool },
    Propose { run: &'a Run, dry_run: bool },
    ProposalStatus { proposal_id: &'a str },
}

/// Last line the action command writes to stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
enum ActionResponse {
    Ok {
        #[serde(default)]
        proposal_id: Option<String>,
        #[serde(default)]
        proposal_status: Option<ProposalStatus>,
    },
    PermissionDenied {
        #[serde(default)]
        reason: String,
    },
    Error {
        #[serde(default)]
        reason: String,
    },
}

/// Runs a command once per action.
///
/// The request is one JSON object on stdin; the command answers with a JSON
/// object as its last stdout line, e.g. `{"status": "ok", "proposal_id": "42"}`
/// or `{"status": "permission-denied", "reason": "..."}`.
pub struct CommandPublishAction {
    command: Vec<String>,
    timeout: Duration,
    dry_run: bool,
}

impl CommandPublishAction {
    /// Creates an action.
    ///
    /// # Errors
    ///
    /// Returns `ActionError::Failed` if `command` is empty.
    pub fn new(
        command: Vec<String>,
        timeout: Duration,
        dry_run: bool,
    ) -> Result<Self, ActionError> {
        if command.is_empty() {
            return Err(ActionError::Failed("publish command is empty".to_string()));
        }
        Ok(Self {
            command,
            timeout,
            dry_run,
        })
    }

    async fn call(&self, request: &ActionRequest<'_>) -> Result<ActionResponse, ActionError> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                // Commands that ignore their input still answer on stdout.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ActionError::Timeout(self.timeout.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("[publish stderr] {}", stderr.trim());
        }

        match stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => Ok(serde_json::from_str(line)?),
            None if output.status.success() => Ok(ActionResponse::Ok {
                proposal_id: None,
                proposal_status: None,
            }),
            None => Err(ActionError::Failed(format!(
                "publish command exited with {}: {}",
                output.status,
                stderr.trim()
            ))),
        }
    }
}

type ActionOk = (Option<String>, Option<ProposalStatus>);

fn into_result(response: ActionResponse) -> Result<ActionOk, ActionError> {
    match response {
        ActionResponse::Ok {
            proposal_id,
            proposal_status,
        } => Ok((proposal_id, proposal_status)),
        ActionResponse::PermissionDenied { reason } => Err(ActionError::PermissionDenied(reason)),
        ActionResponse::Error { reason } => Err(ActionError::Failed(reason)),
    }
}

#[async_trait]
impl PublishAction for CommandPublishAction {
    async fn push(&self, run: &Run) -> Result<(), ActionError> {
        let response = self
            .call(&ActionRequest::Push {
                run,
                dry_run: self.dry_run,
            })
            .await?;
        into_result(response).map(|_| ())
    }

    async fn propose(&self, run: &Run) -> Result<String, ActionError> {
        let response = self
            .call(&ActionRequest::Propose {
                run,
                dry_run: self.dry_run,
            })
            .await?;
        match into_result(response)? {
            (Some(id), _) => Ok(id),
            (None, _) => Err(ActionError::Failed(
                "publish command returned no proposal id".to_string(),
            )),
        }
    }

    async fn proposal_status(&self, proposal_id: &str) -> Result<ProposalStatus, ActionError> {
        let response = self
            .call(&ActionRequest::ProposalStatus { proposal_id })
            .await?;
        Ok(into_result(response)?.1.unwrap_or(ProposalStatus::Open))
    }
}

/// Logs what would be published without touching any host.
///
/// Proposals get a synthetic id and stay open until reported otherwise.
#[derive(Debug, Default)]
pub struct DryRunPublishAction;

#[async_trait]
impl PublishAction for DryRunPublishAction {
    async fn push(&self, run: &Run) -> Result<(), ActionError> {
        info!(run_id = %run.id, key = %run.key, "Dry run: would push");
        Ok(())
    }

    async fn propose(&self, run: &Run) -> Result<String, ActionError> {
        info!(run_id = %run.id, key = %run.key, "Dry run: would propose");
        Ok(format!("dry-run/{}", run.id))
    }

    async fn proposal_status(&self, _proposal_id: &str) -> Result<ProposalStatus, ActionError> {
        Ok(ProposalStatus::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeDescription, Disposition, RunKey, RunOutcome};
    use chrono::Utc;
    use uuid::Uuid;

    fn run() -> Run {
        Run {
            id: Uuid::new_v4(),
            key: RunKey::new("https://example.com/repo", "lintian-fixes"),
            maintainer: "maint".into(),
            worker: "w".into(),
            attempt: 0,
            context: serde_json::Value::Null,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: RunOutcome::Success,
            disposition: Disposition::Completed,
            artifacts_ref: None,
            log_ref: None,
            change: Some(ChangeDescription {
                summary: "Fix".into(),
                diff_summary: "1 file changed".into(),
                branches: Vec::new(),
            }),
        }
    }

    fn sh(script: &str) -> CommandPublishAction {
        CommandPublishAction::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_secs(10),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let r = run();
        let json = serde_json::to_value(ActionRequest::Propose {
            run: &r,
            dry_run: true,
        })
        .unwrap();
        assert_eq!(json["action"], "propose");
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["run"]["key"]["suite"], "lintian-fixes");
    }

    #[tokio::test]
    async fn test_propose_returns_id() {
        let action = sh(r#"cat > /dev/null; echo 'progress...'; echo '{"status":"ok","proposal_id":"mp/17"}'"#);
        assert_eq!(action.propose(&run()).await.unwrap(), "mp/17");
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let action = sh(r#"cat > /dev/null; echo '{"status":"permission-denied","reason":"read-only"}'"#);
        assert!(matches!(
            action.push(&run()).await,
            Err(ActionError::PermissionDenied(r)) if r == "read-only"
        ));
    }

    #[tokio::test]
    async fn test_silent_failure() {
        let action = sh("cat > /dev/null; echo boom >&2; exit 1");
        assert!(matches!(action.push(&run()).await, Err(ActionError::Failed(_))));
    }

    #[tokio::test]
    async fn test_timeout() {
        let action = CommandPublishAction::new(
            vec!["sleep".into(), "30".into()],
            Duration::from_millis(100),
            false,
        )
        .unwrap();
        assert!(matches!(
            action.proposal_status("x").await,
            Err(ActionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_proposal_status() {
        let action = sh(r#"cat > /dev/null; echo '{"status":"ok","proposal_status":"merged"}'"#);
        assert_eq!(
            action.proposal_status("mp/17").await.unwrap(),
            ProposalStatus::Merged
        );
    }
}
