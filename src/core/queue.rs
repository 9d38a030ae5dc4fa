//! Queue consumption.
//!
//! Delivery is at-most-once: the store deletes an item in the same
//! transaction that selects it, and only after that commit is the job handed
//! to the caller. A handler that fails afterwards never puts the item back,
//! because running the job again could repeat container side effects.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::models::Job;

/// Identifies one queue inside the shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub project: String,
    pub name: String,
}

impl QueueId {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.project.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.project, self.name)
        }
    }
}

/// A job removed from the queue together with the key it was stored under.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub key: String,
    pub job: Job,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The store could not complete the request; the next fetch may succeed.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
    /// The item was removed but its payload is not a job.
    #[error("queue item {key} is not a valid job: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// In one transaction, select one pending item of `queue`, delete it and
    /// commit. `None` when the queue has no pending items.
    async fn fetch_and_remove_one(&self, queue: &QueueId) -> Result<Option<QueueItem>, QueueError>;

    /// Enqueue a job as pending.
    async fn put(&self, queue: &QueueId, job: &Job) -> Result<(), QueueError>;
}

/// Why [`QueueConsumer::drain`] stopped before the queue was empty.
#[derive(Debug, Error)]
pub enum DrainError {
    #[error("failed to fetch from queue: {0}")]
    Fetch(#[source] QueueError),
    #[error("job {job} failed: {source:#}")]
    Handler {
        job: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("shutdown requested")]
    Cancelled,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainSummary {
    pub handled: usize,
}

pub struct QueueConsumer {
    store: Arc<dyn QueueStore>,
}

impl QueueConsumer {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn fetch_one(&self, queue: &QueueId) -> Result<Option<Job>, QueueError> {
        let item = self.store.fetch_and_remove_one(queue).await?;
        if let Some(item) = &item {
            debug!(queue = %queue, key = %item.key, job = %item.job.name, "Fetched job");
        }
        Ok(item.map(|item| item.job))
    }

    /// Fetch and handle jobs until the queue is empty.
    ///
    /// Stops at the first fetch error, handler error or cancellation. The
    /// token is checked between jobs only.
    pub async fn drain<F, Fut>(
        &self,
        queue: &QueueId,
        cancel: &CancellationToken,
        mut handler: F,
    ) -> Result<DrainSummary, DrainError>
    where
        F: FnMut(Job) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut summary = DrainSummary::default();

        loop {
            if cancel.is_cancelled() {
                return Err(DrainError::Cancelled);
            }

            let Some(job) = self.fetch_one(queue).await.map_err(DrainError::Fetch)? else {
                info!(queue = %queue, handled = summary.handled, "Queue is empty");
                return Ok(summary);
            };

            let name = job.name.clone();
            handler(job)
                .await
                .map_err(|source| DrainError::Handler { job: name, source })?;
            summary.handled += 1;
        }
    }
}
