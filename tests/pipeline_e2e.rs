//! End-to-end tests: candidates through scheduling, dispatch and publishing.
//!
//! Workers are scripted in-process; storage is the in-memory store and queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use janitor::config::{PublisherConfig, SchedulerConfig};
use janitor::model::{
    Candidate, ChangeDescription, FailureKind, ProposalStatus, PublishMode, WorkerReport,
};
use janitor::publisher::{DryRunPublishAction, Publisher};
use janitor::queue::{MemoryQueue, Queue};
use janitor::runner::{
    Assignment, RetryPolicy, Runner, RunnerSettings, Worker, WorkerError, WorkerEvent,
    WorkerMessage,
};
use janitor::scheduler::{Ranker, Scheduler};
use janitor::storage::{MemoryStore, StateStore};
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

/// Succeeds every run, optionally failing the first attempt of some targets.
struct ScriptedWorker {
    flaky: HashSet<String>,
    active: Mutex<HashMap<String, usize>>,
    max_per_target: Mutex<usize>,
    attempts: Mutex<Vec<(String, u32)>>,
}

impl ScriptedWorker {
    fn new(flaky: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            flaky: flaky.iter().map(|s| s.to_string()).collect(),
            active: Mutex::new(HashMap::new()),
            max_per_target: Mutex::new(0),
            attempts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    fn suites(&self) -> Option<&HashSet<String>> {
        None
    }

    fn capacity(&self) -> usize {
        16
    }

    async fn start(
        &self,
        assignment: Assignment,
        events: mpsc::Sender<WorkerMessage>,
    ) -> Result<(), WorkerError> {
        {
            let mut active = self.active.lock().await;
            let count = active.entry(assignment.target.clone()).or_insert(0);
            *count += 1;
            let mut max = self.max_per_target.lock().await;
            *max = (*max).max(*count);
        }
        self.attempts
            .lock()
            .await
            .push((assignment.key().to_string(), assignment.attempt));

        let report = if self.flaky.contains(&assignment.target) && assignment.attempt == 0 {
            WorkerReport::failure(FailureKind::InfraTransient, "connection reset")
        } else {
            WorkerReport::success(ChangeDescription {
                summary: format!("Apply {}", assignment.suite),
                diff_summary: "1 file changed, 2 insertions(+)".into(),
                branches: Vec::new(),
            })
        };

        let run_id = assignment.run_id;
        for event in [WorkerEvent::Started, WorkerEvent::Heartbeat] {
            let _ = events.send(WorkerMessage { run_id, event }).await;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        if let Some(count) = self.active.lock().await.get_mut(&assignment.target) {
            *count -= 1;
        }
        let _ = events
            .send(WorkerMessage {
                run_id,
                event: WorkerEvent::Result { report },
            })
            .await;
        Ok(())
    }

    async fn cancel(&self, _run_id: Uuid) -> Result<(), WorkerError> {
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    scheduler: Scheduler,
    runner: Arc<Runner>,
    publisher: Publisher,
}

fn harness(worker: Arc<ScriptedWorker>, quota: u32) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(true));

    let publisher_config = PublisherConfig {
        max_open_per_maintainer: Some(quota),
        default_mode: PublishMode::Propose,
        ..Default::default()
    };
    let publisher = Publisher::new(
        &publisher_config,
        store.clone(),
        Arc::new(DryRunPublishAction),
    );

    let scheduler = Scheduler::new(
        Ranker::new(SchedulerConfig::default(), publisher.limiter()),
        StdDuration::from_secs(60),
        store.clone(),
        queue.clone(),
    );

    let settings = RunnerSettings {
        heartbeat_timeout: Duration::seconds(30),
        overall_timeout: Duration::seconds(300),
        poll_interval: StdDuration::from_millis(10),
        signal_timeout: StdDuration::from_secs(1),
        max_concurrency: 16,
    };
    let retry = RetryPolicy::new(3, Duration::milliseconds(50), Duration::seconds(1));
    let runner = Arc::new(
        Runner::new(settings, retry, store.clone(), queue.clone()).with_worker(worker),
    );

    Harness {
        store,
        queue,
        scheduler,
        runner,
        publisher,
    }
}

/// Runs the dispatch loop until `done` runs are recorded.
async fn drive(h: &Harness, done: usize) {
    let (shutdown_tx, _) = broadcast::channel(1);
    let runner = h.runner.clone();
    let shutdown = shutdown_tx.subscribe();
    let task = tokio::spawn(async move { runner.dispatch_loop(shutdown).await });

    let waited = tokio::time::timeout(StdDuration::from_secs(20), async {
        loop {
            if h.store.list_runs(None, 1000).await.unwrap().len() >= done {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await;

    let _ = shutdown_tx.send(());
    task.await.unwrap();
    assert!(waited.is_ok(), "timed out waiting for {} runs", done);
}

#[tokio::test]
async fn test_one_run_per_target_and_quota_of_one() {
    let worker = ScriptedWorker::new(&[]);
    let h = harness(worker.clone(), 1);

    let candidates: Vec<Candidate> = (0..10)
        .map(|i| {
            Candidate::new("https://salsa.debian.org/jelmer/dulwich", format!("suite-{}", i))
                .with_maintainer("jelmer@debian.org")
        })
        .collect();
    h.store.upsert_candidates(&candidates).await.unwrap();

    let report = h.scheduler.run_once().await.unwrap();
    assert_eq!(report.admitted, 10);

    drive(&h, 10).await;
    assert_eq!(*worker.max_per_target.lock().await, 1);
    assert!(h.queue.list().await.unwrap().is_empty());

    // Quota 1: one proposal per cycle, the rest wait.
    let first = h.publisher.run_cycle().await.unwrap();
    assert_eq!((first.published, first.rate_limited), (1, 9));

    let second = h.publisher.run_cycle().await.unwrap();
    assert_eq!((second.published, second.rate_limited), (0, 9));

    let open = h.store.list_open_proposals().await.unwrap();
    assert_eq!(open.len(), 1);
    let proposal = open[0].proposal_id.clone().unwrap();
    h.publisher
        .report_proposal_status(&proposal, ProposalStatus::Merged)
        .await
        .unwrap();

    let third = h.publisher.run_cycle().await.unwrap();
    assert_eq!((third.published, third.rate_limited), (1, 8));
    let policy = h
        .store
        .get_policy("jelmer@debian.org")
        .await
        .unwrap()
        .unwrap();
    assert_eq!((policy.open_proposals, policy.merged_proposals), (1, 1));
}

#[tokio::test]
async fn test_transient_failure_is_retried_to_success() {
    let worker = ScriptedWorker::new(&["https://example.com/flaky"]);
    let h = harness(worker.clone(), 5);

    h.store
        .upsert_candidates(&[
            Candidate::new("https://example.com/flaky", "lintian-fixes"),
            Candidate::new("https://example.com/steady", "lintian-fixes"),
        ])
        .await
        .unwrap();
    h.scheduler.run_once().await.unwrap();

    drive(&h, 3).await;

    let attempts = worker.attempts.lock().await.clone();
    assert!(attempts.contains(&("https://example.com/flaky/lintian-fixes".to_string(), 0)));
    assert!(attempts.contains(&("https://example.com/flaky/lintian-fixes".to_string(), 1)));

    let runs = h.store.list_runs(None, 10).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs.iter().filter(|r| r.is_publishable()).count(), 2);

    let published = h.publisher.run_cycle().await.unwrap();
    assert_eq!(published.published, 2);
}
