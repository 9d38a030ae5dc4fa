use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::container::ContainerLifecycle;
use crate::core::executor::{ExecError, JobExecutor, JobRunner};
use crate::core::journal::{JournalError, ReplayReport, TaskJournal};
use crate::core::models::Job;
use crate::core::plan::PlanBuilder;
use crate::core::queue::{DrainError, QueueConsumer, QueueError, QueueId};

/// What a finished run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub replay: ReplayReport,
    /// Jobs taken from the queue, whatever their outcome.
    pub dequeued: usize,
}

enum Stop {
    Exhausted,
    Cancelled,
    Failed(anyhow::Error),
}

pub struct Orchestrator {
    ctx: AppContext,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    fn journal(&self) -> TaskJournal {
        TaskJournal::new(&self.ctx.config.journal_dir)
    }

    fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            PlanBuilder::new(&self.ctx.config.default_image),
            ContainerLifecycle::new(self.ctx.runtime.clone(), &self.ctx.config.image_prefix),
            self.cancel.clone(),
        )
    }

    /// Replay interrupted jobs, drain `queue`, then retire the instance.
    ///
    /// `Ok` only when the queue was drained. Shutdown returns an error and
    /// leaves the instance running.
    pub async fn start(&self, queue: &QueueId) -> Result<RunSummary> {
        info!(queue = %queue, "Worker starting");

        let executor = self.executor();
        let journal = self.journal();
        let mut summary = RunSummary::default();

        let stop = match journal.sweep_and_replay(&executor, &self.cancel).await {
            Ok(report) => {
                info!(
                    completed = report.completed,
                    failed = report.failed,
                    unreadable = report.unreadable,
                    "Journal replay finished"
                );
                summary.replay = report;
                self.drain(queue, &executor, &journal, &mut summary).await
            }
            Err(e) => Stop::Failed(anyhow::Error::from(e).context("Failed to replay journal")),
        };

        match stop {
            Stop::Exhausted => {
                info!(queue = %queue, dequeued = summary.dequeued, "No more jobs");
                self.retire().await;
                Ok(summary)
            }
            Stop::Failed(e) => {
                error!(queue = %queue, error = %format!("{:#}", e), "Worker stopped on error");
                self.retire().await;
                Err(e)
            }
            Stop::Cancelled => {
                info!(queue = %queue, "Worker interrupted by shutdown");
                Err(anyhow!("Interrupted by shutdown"))
            }
        }
    }

    async fn drain(
        &self,
        queue: &QueueId,
        executor: &JobExecutor,
        journal: &TaskJournal,
        summary: &mut RunSummary,
    ) -> Stop {
        if self.cancel.is_cancelled() {
            return Stop::Cancelled;
        }

        let consumer = QueueConsumer::new(self.ctx.store.clone());
        let retry_delay = Duration::from_secs(self.ctx.config.retry_delay_secs);
        let mut failures = 0u32;
        let mut dequeued_at_last_failure = 0;

        loop {
            let dequeued = &mut summary.dequeued;
            let result = consumer
                .drain(queue, &self.cancel, |job| {
                    *dequeued += 1;
                    self.handle(executor, journal, job)
                })
                .await;

            match result {
                Ok(_) => return Stop::Exhausted,
                Err(DrainError::Cancelled) => return Stop::Cancelled,
                Err(DrainError::Handler { source, .. }) => {
                    if matches!(source.downcast_ref::<ExecError>(), Some(ExecError::Cancelled)) {
                        return Stop::Cancelled;
                    }
                    return Stop::Failed(source);
                }
                Err(DrainError::Fetch(QueueError::Malformed { key, source })) => {
                    warn!(queue = %queue, key = %key, error = %source, phase = "fetch", "Dropping malformed queue item");
                }
                Err(DrainError::Fetch(QueueError::Backend(e))) => {
                    if summary.dequeued > dequeued_at_last_failure {
                        failures = 0;
                    }
                    dequeued_at_last_failure = summary.dequeued;
                    failures += 1;

                    if failures > self.ctx.config.retry_attempts {
                        return Stop::Failed(e.context(format!(
                            "Queue {} unavailable after {} attempts",
                            queue, failures
                        )));
                    }

                    warn!(
                        queue = %queue,
                        attempt = failures,
                        error = %format!("{:#}", e),
                        phase = "fetch",
                        "Queue fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Stop::Cancelled,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }

    /// Journal, execute and clear one dequeued job.
    ///
    /// Jobs that cannot be planned are abandoned and the drain goes on; any
    /// other failure ends the drain.
    async fn handle(&self, executor: &JobExecutor, journal: &TaskJournal, job: Job) -> Result<()> {
        match journal.persist(&job).await {
            Ok(_) => {}
            Err(JournalError::InvalidName(name)) => {
                warn!(job = %name, phase = "journal", "Abandoning job with invalid name");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to journal job {}", job.name));
            }
        }

        match executor.run_job(&job).await {
            Ok(()) => journal
                .remove(&job.name)
                .await
                .with_context(|| format!("Failed to clear journal entry for {}", job.name)),
            Err(ExecError::Plan(e)) => {
                warn!(job = %job.name, phase = "plan", error = %e, "Abandoning malformed job");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn retire(&self) {
        if let Err(e) = self.ctx.instance.self_terminate().await {
            error!(error = %format!("{:#}", e), phase = "terminate", "Failed to terminate instance");
        }
    }
}
