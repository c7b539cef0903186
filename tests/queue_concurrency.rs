//! Concurrency and durability tests against a file-backed SQLite database.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use janitor::model::{AuditKind, RunKey};
use janitor::queue::{PopFilter, Queue, QueueItem, QueueState, SqliteQueue};
use janitor::runner::{RetryPolicy, Runner, RunnerSettings};
use janitor::storage::{Database, SqliteStore, StateStore};
use tempfile::TempDir;

async fn open(dir: &TempDir) -> Database {
    let url = format!("sqlite://{}", dir.path().join("janitor.db").display());
    let db = Database::connect(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

fn item(target: &str, suite: &str) -> QueueItem {
    QueueItem::new(
        RunKey::new(target, suite),
        "maint",
        serde_json::Value::Null,
        1.0,
    )
}

/// Pops until the queue is drained, returning the claimed keys.
async fn drain(queue: Arc<SqliteQueue>, worker: String) -> Vec<RunKey> {
    let filter = PopFilter::for_worker(worker);
    let mut claimed = Vec::new();
    while let Some(item) = queue.pop_next(&filter, Utc::now()).await.unwrap() {
        claimed.push(item.key);
    }
    claimed
}

#[tokio::test]
async fn test_concurrent_pops_claim_each_item_once() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SqliteQueue::new(open(&dir).await, false);
    let items: Vec<QueueItem> = (0..40).map(|i| item(&format!("t{}", i), "s")).collect();
    assert_eq!(seed.push(items).await.unwrap(), 40);

    // Separate pools, as separate processes would have.
    let mut tasks = Vec::new();
    for w in 0..6 {
        let queue = Arc::new(SqliteQueue::new(open(&dir).await, false));
        tasks.push(tokio::spawn(drain(queue, format!("worker-{}", w))));
    }

    let all: Vec<RunKey> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .flat_map(|claimed| claimed.unwrap())
        .collect();
    let unique: HashSet<&RunKey> = all.iter().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
async fn test_concurrent_pops_respect_target_exclusivity() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SqliteQueue::new(open(&dir).await, true);
    let items: Vec<QueueItem> = (0..10)
        .map(|i| item("https://example.com/one", &format!("suite-{}", i)))
        .collect();
    seed.push(items).await.unwrap();

    let mut tasks = Vec::new();
    for w in 0..4 {
        let queue = Arc::new(SqliteQueue::new(open(&dir).await, true));
        tasks.push(tokio::spawn(drain(queue, format!("worker-{}", w))));
    }

    let mut claimed = 0;
    for task in tasks {
        claimed += task.await.unwrap().len();
    }
    assert_eq!(claimed, 1);

    let stats = seed.stats(Utc::now()).await.unwrap();
    assert_eq!((stats.claimed, stats.ready), (1, 9));
}

#[tokio::test]
async fn test_restart_recovers_in_flight_items() {
    let dir = tempfile::tempdir().unwrap();
    let claimed_id = {
        let queue = SqliteQueue::new(open(&dir).await, true);
        queue
            .push(vec![item("a", "s"), item("b", "s")])
            .await
            .unwrap();
        queue
            .pop_next(&PopFilter::for_worker("crashed"), Utc::now())
            .await
            .unwrap()
            .unwrap()
            .id
    };

    // A new process on the same database.
    let db = open(&dir).await;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::new(db.clone()));
    let queue = Arc::new(SqliteQueue::new(db, true));
    let retry = RetryPolicy::new(3, Duration::seconds(60), Duration::seconds(600));
    let runner = Runner::new(RunnerSettings::default(), retry, store.clone(), queue.clone());

    assert_eq!(runner.recover_orphans().await.unwrap(), 1);

    let recovered = queue.get(claimed_id).await.unwrap().unwrap();
    assert_eq!(recovered.state, QueueState::Queued);
    assert_eq!(recovered.attempt, 1);
    assert!(recovered.earliest_eligible > Utc::now());

    let runs = store.list_runs(None, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome.state(), "lost");

    let kinds: Vec<AuditKind> = store
        .list_events(None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&AuditKind::Recovered));
    assert!(kinds.contains(&AuditKind::Requeued));

    // Nothing left to recover.
    assert_eq!(runner.recover_orphans().await.unwrap(), 0);
}
