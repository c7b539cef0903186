//! SQLite-backed queue.
//!
//! Claims are compare-and-set updates: an item is claimed only if it is
//! still queued and, with target exclusivity, no other item of the same
//! target is in flight. Losing a race simply moves on to the next
//! candidate row.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::model::RunKey;
use crate::storage::database::{from_millis, to_millis};
use crate::storage::sqlite::parse_uuid;
use crate::storage::{Database, StoreError};

use super::{
    LeaseRef, PopFilter, Queue, QueueError, QueueItem, QueueState, QueueStats,
    SCHEDULER_REQUESTOR,
};

const ORDER_BY: &str = "ORDER BY priority DESC, staleness_secs DESC, target ASC, suite ASC";

/// Queue stored in the `queue_items` table.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
    target_exclusive: bool,
}

impl SqliteQueue {
    /// Creates a queue on an already migrated database.
    ///
    /// # Arguments
    ///
    /// * `db` - shared database handle
    /// * `target_exclusive` - never run two suites of one target at once
    pub fn new(db: Database, target_exclusive: bool) -> Self {
        Self {
            db,
            target_exclusive,
        }
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.db.pool()
    }

    async fn try_claim(&self, item: &QueueItem, worker: &str) -> Result<bool, QueueError> {
        let sql = if self.target_exclusive {
            r#"
            UPDATE queue_items SET state = 'claimed', assigned_worker = ?
            WHERE id = ? AND state = 'queued'
              AND NOT EXISTS (
                  SELECT 1 FROM queue_items AS other
                  WHERE other.target = queue_items.target AND other.state <> 'queued'
              )
            "#
        } else {
            "UPDATE queue_items SET state = 'claimed', assigned_worker = ? \
             WHERE id = ? AND state = 'queued'"
        };

        let result = sqlx::query(sql)
            .bind(worker)
            .bind(item.id.to_string())
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem, QueueError> {
    let id: String = row.try_get("id")?;
    let context: String = row.try_get("context")?;
    let state: String = row.try_get("state")?;
    let run_id: Option<String> = row.try_get("run_id")?;

    Ok(QueueItem {
        id: parse_uuid(&id)?,
        key: RunKey::new(
            row.try_get::<String, _>("target")?,
            row.try_get::<String, _>("suite")?,
        ),
        maintainer: row.try_get("maintainer")?,
        host: row.try_get("host")?,
        context: serde_json::from_str(&context)?,
        priority: row.try_get("priority")?,
        staleness_secs: row.try_get("staleness_secs")?,
        estimated_duration_secs: row.try_get("estimated_duration_secs")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        earliest_eligible: from_millis(row.try_get("earliest_eligible")?)?,
        state: state.parse().map_err(StoreError::Corrupt)?,
        assigned_worker: row.try_get("assigned_worker")?,
        run_id: run_id.as_deref().map(parse_uuid).transpose()?,
        requestor: row.try_get("requestor")?,
        enqueued_at: from_millis(row.try_get("enqueued_at")?)?,
    })
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn push(&self, items: Vec<QueueItem>) -> Result<usize, QueueError> {
        let mut tx = self.pool().begin().await?;
        let mut written = 0;

        for item in &items {
            let result = sqlx::query(
                r#"
                INSERT INTO queue_items (
                    id, target, suite, maintainer, host, context, priority, staleness_secs,
                    estimated_duration_secs, attempt, earliest_eligible, state, requestor,
                    enqueued_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?)
                ON CONFLICT (target, suite) DO UPDATE SET
                    maintainer = excluded.maintainer,
                    host = excluded.host,
                    context = excluded.context,
                    priority = excluded.priority,
                    staleness_secs = excluded.staleness_secs,
                    estimated_duration_secs = excluded.estimated_duration_secs,
                    requestor = CASE WHEN excluded.requestor = ?
                        THEN queue_items.requestor ELSE excluded.requestor END,
                    earliest_eligible = CASE WHEN excluded.requestor = ?
                        THEN queue_items.earliest_eligible ELSE excluded.earliest_eligible END
                WHERE queue_items.state = 'queued'
                  AND (excluded.requestor <> ? OR queue_items.requestor = ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(&item.key.target)
            .bind(&item.key.suite)
            .bind(&item.maintainer)
            .bind(&item.host)
            .bind(item.context.to_string())
            .bind(item.priority)
            .bind(item.staleness_secs)
            .bind(item.estimated_duration_secs)
            .bind(i64::from(item.attempt))
            .bind(to_millis(item.earliest_eligible))
            .bind(&item.requestor)
            .bind(to_millis(item.enqueued_at))
            .bind(SCHEDULER_REQUESTOR)
            .bind(SCHEDULER_REQUESTOR)
            .bind(SCHEDULER_REQUESTOR)
            .bind(SCHEDULER_REQUESTOR)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn pop_next(
        &self,
        filter: &PopFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM queue_items WHERE state = 'queued' AND earliest_eligible <= ? {}",
            ORDER_BY
        ))
        .bind(to_millis(now))
        .fetch_all(self.pool())
        .await?;

        for row in &rows {
            let mut item = item_from_row(row)?;
            if !filter.accepts(&item) {
                continue;
            }
            if self.try_claim(&item, &filter.worker).await? {
                item.state = QueueState::Claimed;
                item.assigned_worker = Some(filter.worker.clone());
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    async fn mark_in_progress(&self, item_id: Uuid, lease: &LeaseRef) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE queue_items SET state = 'in-progress', run_id = ?, assigned_worker = ? \
             WHERE id = ? AND state = 'claimed'",
        )
        .bind(lease.run_id.to_string())
        .bind(&lease.worker)
        .bind(item_id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(item_id).await? {
            Some(item) => Err(QueueError::InvalidState {
                id: item_id,
                state: item.state,
                expected: QueueState::Claimed,
            }),
            None => Err(QueueError::ItemNotFound(item_id)),
        }
    }

    async fn requeue(&self, item_id: Uuid, backoff: Duration) -> Result<QueueItem, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items SET
                state = 'queued',
                attempt = attempt + 1,
                earliest_eligible = ?,
                assigned_worker = NULL,
                run_id = NULL
            WHERE id = ?
            "#,
        )
        .bind(to_millis(Utc::now() + backoff))
        .bind(item_id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::ItemNotFound(item_id));
        }

        self.get(item_id)
            .await?
            .ok_or(QueueError::ItemNotFound(item_id))
    }

    async fn remove(&self, item_id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(item_id.to_string())
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query("SELECT * FROM queue_items WHERE id = ?")
            .bind(item_id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(&format!("SELECT * FROM queue_items {}", ORDER_BY))
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn retain_pending(&self, keep: &HashSet<RunKey>) -> Result<usize, QueueError> {
        let evictable: Vec<QueueItem> = self
            .list()
            .await?
            .into_iter()
            .filter(|i| !i.state.is_in_flight() && !i.is_pinned() && !keep.contains(&i.key))
            .collect();

        let mut tx = self.pool().begin().await?;
        let mut evicted = 0;
        for item in &evictable {
            // Re-check the state: the item may have been claimed meanwhile.
            let result = sqlx::query(
                "DELETE FROM queue_items WHERE id = ? AND state = 'queued' \
                 AND attempt = 0 AND requestor = ?",
            )
            .bind(item.id.to_string())
            .bind(SCHEDULER_REQUESTOR)
            .execute(&mut *tx)
            .await?;
            evicted += result.rows_affected() as usize;
        }
        tx.commit().await?;

        Ok(evicted)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let items = self.list().await?;
        Ok(QueueStats::from_items(&items, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn queue(target_exclusive: bool) -> SqliteQueue {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        SqliteQueue::new(db, target_exclusive)
    }

    fn item(target: &str, suite: &str, priority: f64) -> QueueItem {
        QueueItem::new(
            RunKey::new(target, suite),
            "m",
            json!({"target": target}),
            priority,
        )
    }

    #[tokio::test]
    async fn test_push_and_pop_order() {
        let queue = queue(false).await;
        queue
            .push(vec![
                item("https://example.com/a", "s", 1.0),
                item("https://example.com/b", "s", 5.0),
                item("https://example.com/c", "s", 3.0),
            ])
            .await
            .unwrap();

        let filter = PopFilter::for_worker("w");
        let first = queue.pop_next(&filter, Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.key.target, "https://example.com/b");
        assert_eq!(first.host.as_deref(), Some("example.com"));
        assert_eq!(first.context, json!({"target": "https://example.com/b"}));

        let stored = queue.get(first.id).await.unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Claimed);

        let stats = queue.stats(Utc::now()).await.unwrap();
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.claimed, 1);
    }

    #[tokio::test]
    async fn test_push_upserts_queued_items() {
        let queue = queue(true).await;
        assert_eq!(queue.push(vec![item("a", "s", 1.0)]).await.unwrap(), 1);
        assert_eq!(queue.push(vec![item("a", "s", 4.0)]).await.unwrap(), 1);

        let items = queue.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].priority, 4.0);

        let claimed = queue
            .pop_next(&PopFilter::for_worker("w"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.push(vec![item("a", "s", 9.0)]).await.unwrap(), 0);
        assert_eq!(queue.get(claimed.id).await.unwrap().unwrap().priority, 4.0);
    }

    #[tokio::test]
    async fn test_requeue_and_remove() {
        let queue = queue(true).await;
        queue.push(vec![item("a", "s", 1.0)]).await.unwrap();
        let filter = PopFilter::for_worker("w");
        let claimed = queue.pop_next(&filter, Utc::now()).await.unwrap().unwrap();

        let lease = LeaseRef {
            run_id: Uuid::new_v4(),
            worker: "w".into(),
        };
        queue.mark_in_progress(claimed.id, &lease).await.unwrap();
        assert_eq!(
            queue.get(claimed.id).await.unwrap().unwrap().run_id,
            Some(lease.run_id)
        );

        let requeued = queue
            .requeue(claimed.id, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(requeued.attempt, 1);
        assert!(requeued.run_id.is_none());
        assert!(queue.pop_next(&filter, Utc::now()).await.unwrap().is_none());
        assert!(queue
            .pop_next(&filter, Utc::now() + Duration::seconds(31))
            .await
            .unwrap()
            .is_some());

        assert!(queue.remove(claimed.id).await.unwrap());
        assert!(matches!(
            queue.mark_in_progress(claimed.id, &lease).await,
            Err(QueueError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_target_exclusive_claims() {
        let queue = queue(true).await;
        queue
            .push(vec![item("a", "s1", 2.0), item("a", "s2", 1.0)])
            .await
            .unwrap();
        let filter = PopFilter::for_worker("w");
        assert!(queue.pop_next(&filter, Utc::now()).await.unwrap().is_some());
        assert!(queue.pop_next(&filter, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retain_pending_keeps_pinned_and_in_flight() {
        let queue = queue(true).await;
        queue
            .push(vec![
                item("a", "s", 1.0),
                item("b", "s", 1.0),
                item("c", "s", 1.0).with_requestor("operator"),
            ])
            .await
            .unwrap();
        let keep: HashSet<RunKey> = [RunKey::new("b", "s")].into_iter().collect();
        assert_eq!(queue.retain_pending(&keep).await.unwrap(), 1);

        let remaining: Vec<String> = queue
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key.target)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"b".to_string()));
        assert!(remaining.contains(&"c".to_string()));
    }
}
