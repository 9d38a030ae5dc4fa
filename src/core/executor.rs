use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::container::{ContainerError, ContainerLifecycle};
use super::models::Job;
use super::plan::{PlanBuilder, PlanError};

#[derive(Debug, Error)]
pub enum ExecError {
    /// The job itself is unusable; running it again will not help.
    #[error("invalid job: {0}")]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("interrupted by shutdown")]
    Cancelled,
}

/// Runs one job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: &Job) -> Result<(), ExecError>;
}

/// Builds a job's plan and runs it through the container lifecycle.
pub struct JobExecutor {
    plans: PlanBuilder,
    lifecycle: ContainerLifecycle,
    cancel: CancellationToken,
}

impl JobExecutor {
    pub fn new(plans: PlanBuilder, lifecycle: ContainerLifecycle, cancel: CancellationToken) -> Self {
        Self {
            plans,
            lifecycle,
            cancel,
        }
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run_job(&self, job: &Job) -> Result<(), ExecError> {
        let plan = self.plans.build(job)?;
        info!(
            job = %job.name,
            phase = "execute",
            image = %self.plans.image_for(job),
            "Starting job"
        );

        // The container is left running on shutdown; the journal entry
        // brings it back through `replace` on the next start.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecError::Cancelled),
            result = self.lifecycle.run(&job.name, &plan.dockerfile, &plan.entrypoint) => {
                result?;
                info!(job = %job.name, phase = "execute", "Job finished");
                Ok(())
            }
        }
    }
}
