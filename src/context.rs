use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::container::{ContainerRuntime, DockerCli};
use crate::core::instance::{self, InstanceController};
use crate::core::queue::QueueStore;
use crate::db::SqliteQueueStore;
use tokio_rusqlite::Connection;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn QueueStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub instance: Arc<dyn InstanceController>,
}

impl AppContext {
    /// Production wiring: SQLite queue, docker CLI and the configured
    /// instance controller.
    pub fn new(config: AppConfig, db: Connection) -> Self {
        let runtime = Arc::new(DockerCli::new(&config.docker_binary));
        let instance = instance::create_controller(&config);

        Self {
            store: Arc::new(SqliteQueueStore::new(db)),
            runtime,
            instance,
            config: Arc::new(config),
        }
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn QueueStore>,
        runtime: Arc<dyn ContainerRuntime>,
        instance: Arc<dyn InstanceController>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            runtime,
            instance,
        }
    }
}
