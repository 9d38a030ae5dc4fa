pub mod container;
pub mod executor;
pub mod instance;
pub mod journal;
pub mod models;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod url_resolver;

pub use container::{ContainerError, ContainerLifecycle, ContainerRuntime, DockerCli};
pub use executor::{ExecError, JobExecutor, JobRunner};
pub use instance::{DisabledInstanceController, GceInstanceController, InstanceController};
pub use journal::{ReplayReport, TaskJournal};
pub use models::{ArchiveKind, DownloadSpec, Job};
pub use orchestrator::{Orchestrator, RunSummary};
pub use queue::{QueueConsumer, QueueId, QueueStore};
