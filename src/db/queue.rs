use anyhow::anyhow;
use async_trait::async_trait;
use tokio_rusqlite::{
    Connection, params,
    rusqlite::{self, OptionalExtension, TransactionBehavior},
};
use uuid::Uuid;

use crate::core::Job;
use crate::core::queue::{QueueError, QueueId, QueueItem, QueueStore};

/// Queue store on a SQLite database shared by all workers.
///
/// Dequeue runs in an `IMMEDIATE` transaction, so two workers can never
/// select the same row: the second one waits for the first to commit its
/// delete and then sees the row gone.
#[derive(Clone)]
pub struct SqliteQueueStore {
    conn: Connection,
}

impl SqliteQueueStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Number of items still waiting to be fetched.
    pub async fn pending(&self, queue: &QueueId) -> Result<u64, QueueError> {
        let (project, name) = (queue.project.clone(), queue.name.clone());

        self.conn
            .call(move |c| {
                c.query_row(
                    "SELECT COUNT(*) FROM queue_items
                     WHERE project = ?1 AND queue = ?2 AND claimed = 0",
                    params![project, name],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .map(|count| count.max(0) as u64)
            .map_err(|e| QueueError::Backend(anyhow!("Failed to count queue items: {}", e)))
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn fetch_and_remove_one(&self, queue: &QueueId) -> Result<Option<QueueItem>, QueueError> {
        let (project, name) = (queue.project.clone(), queue.name.clone());

        let row = self
            .conn
            .call(move |c| {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let row = tx
                    .query_row(
                        "SELECT id, payload FROM queue_items
                         WHERE project = ?1 AND queue = ?2 AND claimed = 0
                         ORDER BY created_at, id
                         LIMIT 1",
                        params![project, name],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;

                if let Some((id, _)) = &row {
                    tx.execute("DELETE FROM queue_items WHERE id = ?1", params![id])?;
                }

                tx.commit()?;
                Ok::<_, rusqlite::Error>(row)
            })
            .await
            .map_err(|e| QueueError::Backend(anyhow!("Queue transaction failed: {}", e)))?;

        let Some((key, payload)) = row else {
            return Ok(None);
        };

        // Already deleted: a broken payload must not block the queue.
        let job = serde_json::from_str(&payload)
            .map_err(|source| QueueError::Malformed {
                key: key.clone(),
                source,
            })?;

        Ok(Some(QueueItem { key, job }))
    }

    async fn put(&self, queue: &QueueId, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| QueueError::Backend(anyhow!("Failed to encode job: {}", e)))?;
        let (project, name) = (queue.project.clone(), queue.name.clone());
        let id = Uuid::now_v7().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO queue_items (id, project, queue, claimed, payload, created_at)
                     VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                    params![id, project, name, payload, created_at],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(|e| QueueError::Backend(anyhow!("Failed to enqueue job: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> SqliteQueueStore {
        SqliteQueueStore::new(db::init_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn empty_queue_yields_none() {
        let store = store().await;
        let queue = QueueId::new("p", "q");

        assert!(store.fetch_and_remove_one(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_removes_the_item() {
        let store = store().await;
        let queue = QueueId::new("p", "q");
        store.put(&queue, &Job::new("job-1")).await.unwrap();

        let item = store.fetch_and_remove_one(&queue).await.unwrap().unwrap();

        assert_eq!(item.job.name, "job-1");
        assert_eq!(store.pending(&queue).await.unwrap(), 0);
        assert!(store.fetch_and_remove_one(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let store = store().await;
        store.put(&QueueId::new("p", "a"), &Job::new("in-a")).await.unwrap();
        store.put(&QueueId::new("other", "b"), &Job::new("in-b")).await.unwrap();

        assert!(
            store
                .fetch_and_remove_one(&QueueId::new("p", "b"))
                .await
                .unwrap()
                .is_none()
        );
        let item = store
            .fetch_and_remove_one(&QueueId::new("p", "a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.job.name, "in-a");
    }

    #[tokio::test]
    async fn claimed_items_are_invisible() {
        let store = store().await;
        let queue = QueueId::new("", "q");
        store.put(&queue, &Job::new("held")).await.unwrap();

        store
            .connection()
            .call(|c| {
                c.execute("UPDATE queue_items SET claimed = 1", [])?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        assert!(store.fetch_and_remove_one(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let store = store().await;
        let queue = QueueId::new("", "q");

        store
            .connection()
            .call(|c| {
                c.execute(
                    "INSERT INTO queue_items (id, project, queue, claimed, payload, created_at)
                     VALUES ('bad', '', 'q', 0, 'not json', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let err = store.fetch_and_remove_one(&queue).await.unwrap_err();
        assert!(matches!(err, QueueError::Malformed { ref key, .. } if key == "bad"));
        assert!(store.fetch_and_remove_one(&queue).await.unwrap().is_none());
    }
}
