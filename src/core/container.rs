pub mod docker;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use docker::DockerCli;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o with `{command}` failed: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("container {name} exited with {}", exit_description(.code))]
    Exited { name: String, code: Option<i32> },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Where a job's container is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Building,
    Running,
    Failed,
}

/// The operations the lifecycle needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build (or rebuild from cache) an image from a Dockerfile.
    async fn build_image(&self, tag: &str, dockerfile: &[u8]) -> Result<(), ContainerError>;

    /// Id of the container named exactly `name`, running or stopped.
    async fn lookup(&self, name: &str) -> Result<Option<String>, ContainerError>;

    /// Force-remove a container and its volumes.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;

    /// Start a container, stream `payload` to its stdin and wait for it to
    /// exit. A non-zero exit is an error.
    async fn run(&self, tag: &str, name: &str, payload: &[u8]) -> Result<(), ContainerError>;
}

/// Keeps at most one container per job name.
pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    image_prefix: String,
    state: Mutex<ContainerState>,
}

impl ContainerLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image_prefix: impl Into<String>) -> Self {
        Self {
            runtime,
            image_prefix: image_prefix.into(),
            state: Mutex::new(ContainerState::Absent),
        }
    }

    /// Image repositories must be lowercase.
    pub fn image_tag(&self, name: &str) -> String {
        format!("{}/{}", self.image_prefix, name.to_ascii_lowercase())
    }

    #[cfg(test)]
    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, name: &str, next: ContainerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!(container = %name, from = ?*state, to = ?next, "Container state change");
        *state = next;
    }

    pub async fn lookup(&self, name: &str) -> Result<Option<String>, ContainerError> {
        self.runtime.lookup(name).await
    }

    /// Remove any container, running or stopped, that already uses `name`.
    pub async fn replace(&self, name: &str) -> Result<(), ContainerError> {
        if let Some(id) = self.lookup(name).await? {
            info!(container = %name, id = %id, "Removing stale container");
            self.runtime.remove(&id).await?;
        }
        Ok(())
    }

    /// Replace, build, run to completion and remove the container.
    pub async fn run(
        &self,
        name: &str,
        dockerfile: &[u8],
        entrypoint: &[u8],
    ) -> Result<(), ContainerError> {
        let result = self.run_inner(name, dockerfile, entrypoint).await;

        if let Err(e) = self.discard(name).await {
            warn!(container = %name, error = %e, "Failed to remove finished container");
        }

        match &result {
            Ok(()) => self.transition(name, ContainerState::Absent),
            Err(_) => self.transition(name, ContainerState::Failed),
        }
        result
    }

    async fn run_inner(
        &self,
        name: &str,
        dockerfile: &[u8],
        entrypoint: &[u8],
    ) -> Result<(), ContainerError> {
        self.replace(name).await?;

        let tag = self.image_tag(name);
        self.transition(name, ContainerState::Building);
        info!(container = %name, image = %tag, "Building image");
        self.runtime.build_image(&tag, dockerfile).await?;

        self.transition(name, ContainerState::Running);
        info!(container = %name, image = %tag, "Running container");
        self.runtime.run(&tag, name, entrypoint).await
    }

    async fn discard(&self, name: &str) -> Result<(), ContainerError> {
        if let Some(id) = self.lookup(name).await? {
            self.runtime.remove(&id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;

    /// In-memory runtime that refuses to create a second container with a
    /// name already in use, as the real engine does.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub containers: Mutex<HashMap<String, String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_run: Mutex<Option<i32>>,
        next_id: Mutex<u32>,
    }

    impl FakeRuntime {
        pub fn with_container(name: &str, id: &str) -> Self {
            let fake = Self::default();
            fake.containers
                .lock()
                .unwrap()
                .insert(name.to_string(), id.to_string());
            fake
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn build_image(&self, tag: &str, _dockerfile: &[u8]) -> Result<(), ContainerError> {
            self.record(format!("build {tag}"));
            Ok(())
        }

        async fn lookup(&self, name: &str) -> Result<Option<String>, ContainerError> {
            self.record(format!("lookup {name}"));
            Ok(self.containers.lock().unwrap().get(name).cloned())
        }

        async fn remove(&self, id: &str) -> Result<(), ContainerError> {
            self.record(format!("remove {id}"));
            self.containers.lock().unwrap().retain(|_, v| v.as_str() != id);
            Ok(())
        }

        async fn run(&self, tag: &str, name: &str, _payload: &[u8]) -> Result<(), ContainerError> {
            self.record(format!("run {tag} {name}"));
            {
                let mut containers = self.containers.lock().unwrap();
                if containers.contains_key(name) {
                    return Err(ContainerError::Command {
                        command: format!("run {name}"),
                        status: "exit status: 125".to_string(),
                        stderr: "name already in use".to_string(),
                    });
                }
                let mut next_id = self.next_id.lock().unwrap();
                *next_id += 1;
                containers.insert(name.to_string(), format!("id-{next_id}"));
            }

            match *self.fail_run.lock().unwrap() {
                Some(code) => Err(ContainerError::Exited {
                    name: name.to_string(),
                    code: Some(code),
                }),
                None => Ok(()),
            }
        }
    }
}
