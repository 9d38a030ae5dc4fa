use std::collections::HashSet;
use std::sync::Arc;

use runq::core::Job;
use runq::core::queue::{QueueConsumer, QueueId, QueueStore};
use runq::db::{self, SqliteQueueStore};
use tokio_util::sync::CancellationToken;

async fn open(path: &std::path::Path) -> SqliteQueueStore {
    SqliteQueueStore::new(db::init(path).await.unwrap())
}

#[tokio::test]
async fn workers_sharing_a_database_never_receive_the_same_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let queue = QueueId::new("proj", "jobs");

    let producer = open(&path).await;
    let names: Vec<String> = (0..40).map(|i| format!("job-{i:02}")).collect();
    for name in &names {
        producer.put(&queue, &Job::new(name.as_str())).await.unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..4 {
        let store = open(&path).await;
        let queue = queue.clone();
        workers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(item) = store.fetch_and_remove_one(&queue).await.unwrap() {
                seen.push(item.job.name);
            }
            seen
        }));
    }

    let mut delivered = Vec::new();
    for worker in workers {
        delivered.extend(worker.await.unwrap());
    }

    let unique: HashSet<_> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), names.len(), "a job was delivered twice");
    assert_eq!(unique, names.into_iter().collect::<HashSet<_>>());
    assert_eq!(producer.pending(&queue).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_handler_does_not_return_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(&dir.path().join("queue.db")).await);
    let queue = QueueId::new("", "jobs");
    store.put(&queue, &Job::new("fragile")).await.unwrap();

    let consumer = QueueConsumer::new(store.clone());
    let result = consumer
        .drain(&queue, &CancellationToken::new(), |_| async {
            Err::<(), _>(anyhow::anyhow!("container exited with status 1"))
        })
        .await;

    assert!(result.is_err());
    assert!(consumer.fetch_one(&queue).await.unwrap().is_none());
}

#[tokio::test]
async fn queue_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/queue.db");
    let queue = QueueId::new("", "jobs");

    open(&path).await.put(&queue, &Job::new("persisted")).await.unwrap();

    let item = open(&path)
        .await
        .fetch_and_remove_one(&queue)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.job.name, "persisted");
}
