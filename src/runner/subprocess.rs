//! Worker that runs each assignment as a local subprocess.
//!
//! Protocol: the assignment is written as one JSON object on stdin, then
//! stdin is closed. The process writes line-delimited [`WorkerEvent`]s on
//! stdout. Anything on stderr is logged. A process that exits without a
//! `result` line is reported as an infra-transient failure.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{FailureKind, WorkerReport};

use super::worker::{Assignment, Worker, WorkerError, WorkerEvent, WorkerMessage};

/// Runs assignments with a configured command.
pub struct SubprocessWorker {
    name: String,
    command: Vec<String>,
    suites: Option<HashSet<String>>,
    capacity: usize,
    running: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

impl SubprocessWorker {
    /// Creates a worker.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Spawn` if `command` is empty.
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        capacity: usize,
    ) -> Result<Self, WorkerError> {
        if command.is_empty() {
            return Err(WorkerError::Spawn("worker command is empty".to_string()));
        }
        Ok(Self {
            name: name.into(),
            command,
            suites: None,
            capacity,
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Restricts the worker to the given suites.
    pub fn with_suites(mut self, suites: Option<Vec<String>>) -> Self {
        self.suites = suites.map(|s| s.into_iter().collect());
        self
    }

    fn spawn(&self, assignment: &Assignment) -> Result<Child, WorkerError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env("JANITOR_RUN_ID", assignment.run_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {}", self.command[0], e)))
    }
}

/// Writes the assignment and closes stdin.
///
/// Runs on its own task: a process that never reads its input blocks only
/// this writer, which ends when the process is killed.
async fn feed(run_id: Uuid, mut stdin: ChildStdin, payload: Vec<u8>) {
    let written = async {
        stdin.write_all(&payload).await?;
        stdin.shutdown().await
    };
    match written.await {
        Ok(()) => {}
        // Exited without reading; reported when the process is reaped.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!(run_id = %run_id, "Worker closed stdin early");
        }
        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to write assignment"),
    }
}

#[async_trait]
impl Worker for SubprocessWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn suites(&self) -> Option<&HashSet<String>> {
        self.suites.as_ref()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn start(
        &self,
        assignment: Assignment,
        events: mpsc::Sender<WorkerMessage>,
    ) -> Result<(), WorkerError> {
        let mut payload = serde_json::to_vec(&assignment)?;
        payload.push(b'\n');

        let mut child = self.spawn(&assignment)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let run_id = assignment.run_id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running.lock().await.insert(run_id, cancel_tx);

        info!(
            run_id = %run_id,
            worker = %self.name,
            key = %assignment.key(),
            "Started worker process"
        );

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed(run_id, stdin, payload));
        }

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id = %run_id, "[worker stderr] {}", line);
                }
            });
        }

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            supervise(run_id, child, stdout, cancel_rx, events).await;
            running.lock().await.remove(&run_id);
        });

        Ok(())
    }

    async fn cancel(&self, run_id: Uuid) -> Result<(), WorkerError> {
        let cancel = self
            .running
            .lock()
            .await
            .remove(&run_id)
            .ok_or(WorkerError::NotRunning(run_id))?;
        // The process may have exited already.
        let _ = cancel.send(());
        Ok(())
    }
}

/// Relays protocol lines until the process exits or is cancelled.
async fn supervise(
    run_id: Uuid,
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    mut cancel: oneshot::Receiver<()>,
    events: mpsc::Sender<WorkerMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut reported = false;

    loop {
        tokio::select! {
            _ = &mut cancel => {
                info!(run_id = %run_id, "Killing cancelled worker process");
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<WorkerEvent>(&line) {
                        Ok(event) => {
                            reported |= matches!(event, WorkerEvent::Result { .. });
                            if events.send(WorkerMessage { run_id, event }).await.is_err() {
                                let _ = child.kill().await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "Ignoring malformed worker message");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "Error reading worker stdout");
                        break;
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = &mut cancel => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };

    if reported {
        return;
    }

    let reason = match status {
        Ok(status) => format!("worker exited with {} without a result", status),
        Err(e) => format!("failed to wait for worker: {}", e),
    };
    warn!(run_id = %run_id, reason = %reason, "Worker process ended without a result");
    let report = WorkerReport::failure(FailureKind::InfraTransient, reason);
    let _ = events
        .send(WorkerMessage {
            run_id,
            event: WorkerEvent::Result { report },
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assignment() -> Assignment {
        Assignment {
            run_id: Uuid::new_v4(),
            target: "https://example.com/repo".into(),
            suite: "lintian-fixes".into(),
            attempt: 0,
            context: serde_json::json!({"tag": "x"}),
            heartbeat_interval_secs: 30,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn next(rx: &mut mpsc::Receiver<WorkerMessage>) -> WorkerMessage {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(SubprocessWorker::new("w", Vec::new(), 1).is_err());
    }

    #[tokio::test]
    async fn test_relays_protocol_messages() {
        let script = r#"read line; echo '{"type":"started"}'; echo 'not json'; echo '{"type":"heartbeat"}'; echo '{"type":"result","report":{"status":"success","change":{"diff_summary":"1 file changed"}}}'"#;
        let worker = SubprocessWorker::new("w", sh(script), 1).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let a = assignment();
        worker.start(a.clone(), tx).await.unwrap();

        assert_eq!(next(&mut rx).await.event, WorkerEvent::Started);
        assert_eq!(next(&mut rx).await.event, WorkerEvent::Heartbeat);
        let msg = next(&mut rx).await;
        assert_eq!(msg.run_id, a.run_id);
        let WorkerEvent::Result { report } = msg.event else {
            panic!("expected a result");
        };
        assert_eq!(report.change.unwrap().diff_summary, "1 file changed");
    }

    #[tokio::test]
    async fn test_exit_without_result_is_transient() {
        let worker = SubprocessWorker::new("w", sh("read line; exit 3"), 1).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        worker.start(assignment(), tx).await.unwrap();

        let WorkerEvent::Result { report } = next(&mut rx).await.event else {
            panic!("expected a result");
        };
        assert_eq!(
            report.run_outcome().failure_kind(),
            Some(FailureKind::InfraTransient)
        );
    }

    #[tokio::test]
    async fn test_start_does_not_wait_for_stdin_reader() {
        let worker = SubprocessWorker::new("w", sh("sleep 30"), 1).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut a = assignment();
        a.context = serde_json::json!({"blob": "x".repeat(1024 * 1024)});

        let start = worker.start(a.clone(), tx);
        let started = tokio::time::timeout(Duration::from_secs(5), start).await;
        assert!(matches!(started, Ok(Ok(()))));

        worker.cancel(a.run_id).await.unwrap();
        let after = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(after, Ok(None)));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let script = sh("echo '{\"type\":\"started\"}'; sleep 60");
        let worker = SubprocessWorker::new("w", script, 1).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let a = assignment();
        worker.start(a.clone(), tx).await.unwrap();
        assert_eq!(next(&mut rx).await.event, WorkerEvent::Started);

        worker.cancel(a.run_id).await.unwrap();
        let after = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(after, Ok(None)));
        assert!(matches!(
            worker.cancel(a.run_id).await,
            Err(WorkerError::NotRunning(_))
        ));
    }
}
