use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/runq/config.toml";
const ENV_PREFIX: &str = "RUNQ_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Directory holding one `<job-name>.yml` per in-flight job.
    pub journal_dir: PathBuf,
    /// SQLite database backing the shared queue.
    pub queue_db: PathBuf,
    /// Base image used when a job does not name one.
    pub default_image: String,
    /// Repository prefix for per-job image tags.
    pub image_prefix: String,
    pub docker_binary: PathBuf,
    /// How many consecutive queue fetch failures are tolerated.
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    /// Delete this compute instance once the queue is drained.
    pub self_terminate: bool,
    pub metadata_url: String,
    pub compute_url: String,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            journal_dir: PathBuf::from("/var/lib/runq/journal"),
            queue_db: PathBuf::from("/var/lib/runq/queue.db"),
            default_image: "google/cloud-sdk:slim".to_string(),
            image_prefix: "runq".to_string(),
            docker_binary: PathBuf::from("docker"),
            retry_attempts: 3,
            retry_delay_secs: 5,
            self_terminate: true,
            metadata_url: "http://metadata.google.internal/computeMetadata/v1".to_string(),
            compute_url: "https://compute.googleapis.com/compute/v1".to_string(),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file, then `RUNQ_*`
    /// environment variables, then CLI overrides.
    ///
    /// The file is taken from `RUNQ_CONFIG` when set. A missing file is not an
    /// error.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let path = std::env::var("RUNQ_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::load(&path, overrides)
    }

    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        if let Some(args) = overrides {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }
}
