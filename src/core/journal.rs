//! Local record of in-flight jobs.
//!
//! A job is written here before its container starts and removed once the
//! container lifecycle finishes. Whatever is left at process start belongs to
//! a worker that died mid-job and is run again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::executor::{ExecError, JobRunner};
use super::models::Job;

const EXTENSION: &str = "yml";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("invalid job name {0:?}")]
    InvalidName(String),
    #[error("journal i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode job {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> JournalError + '_ {
    move |source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Outcome of replaying leftover journal entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries run to completion and removed.
    pub completed: usize,
    /// Entries whose run failed; left in place.
    pub failed: usize,
    /// Entries that could not be read as a job; left in place.
    pub unreadable: usize,
}

#[derive(Debug, Clone)]
pub struct TaskJournal {
    dir: PathBuf,
}

impl TaskJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, JournalError> {
        if !Job::is_valid_name(name) {
            return Err(JournalError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.{EXTENSION}")))
    }

    /// Write the job to `<dir>/<name>.yml`, replacing any previous entry.
    pub async fn persist(&self, job: &Job) -> Result<PathBuf, JournalError> {
        let path = self.path_for(&job.name)?;
        let body = serde_yaml::to_string(job).map_err(|source| JournalError::Encode {
            name: job.name.clone(),
            source,
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        // Rename keeps a crash from leaving a truncated entry behind.
        let tmp = self.dir.join(format!(".{}.{EXTENSION}.tmp", job.name));
        tokio::fs::write(&tmp, body).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(&path))?;

        Ok(path)
    }

    pub async fn remove(&self, name: &str) -> Result<(), JournalError> {
        let path = self.path_for(name)?;
        remove_file(&path).await
    }

    pub async fn load(&self, path: &Path) -> Result<Job, JournalError> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(io_error(path))?;
        serde_yaml::from_str(&body).map_err(|source| JournalError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// All journal entries, sorted by file name. A missing directory is empty.
    pub async fn entries(&self) -> Result<Vec<PathBuf>, JournalError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            let is_entry = path.extension().is_some_and(|ext| ext == EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_entry {
                entries.push(path);
            }
        }

        entries.sort();
        Ok(entries)
    }

    /// Run every leftover entry through `runner`, removing each one that
    /// completes. Failures are logged and left for the next start.
    pub async fn sweep_and_replay(
        &self,
        runner: &dyn JobRunner,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, JournalError> {
        let mut report = ReplayReport::default();

        for path in self.entries().await? {
            if cancel.is_cancelled() {
                break;
            }

            let job = match self.load(&path).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable journal entry");
                    report.unreadable += 1;
                    continue;
                }
            };

            info!(job = %job.name, phase = "replay", "Replaying interrupted job");
            match runner.run_job(&job).await {
                Ok(()) => {
                    remove_file(&path).await?;
                    report.completed += 1;
                }
                Err(ExecError::Cancelled) => {
                    info!(job = %job.name, phase = "replay", "Replay interrupted by shutdown");
                    break;
                }
                Err(e) => {
                    warn!(job = %job.name, phase = "replay", error = %e, "Replay failed, keeping journal entry");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

async fn remove_file(path: &Path) -> Result<(), JournalError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::core::container::ContainerError;

    #[derive(Default)]
    struct RecordingRunner {
        ran: Mutex<Vec<String>>,
        fail: Vec<String>,
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn run_job(&self, job: &Job) -> Result<(), ExecError> {
            self.ran.lock().unwrap().push(job.name.clone());
            if self.fail.contains(&job.name) {
                return Err(ExecError::Container(ContainerError::Exited {
                    name: job.name.clone(),
                    code: Some(1),
                }));
            }
            Ok(())
        }
    }

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            image: Some("base".to_string()),
            apt_packages: vec!["curl".to_string()],
            source: Some("https://example.com/src.zip:src/".to_string()),
            run: vec!["make".to_string()],
            result: Some("gs://bucket/out".to_string()),
            upload: vec!["*.txt".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TaskJournal::new(dir.path().join("journal"));

        let path = journal.persist(&job("job-1")).await.unwrap();

        assert_eq!(path, dir.path().join("journal/job-1.yml"));
        assert_eq!(journal.load(&path).await.unwrap(), job("job-1"));
        assert_eq!(journal.entries().await.unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn file_uses_queue_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TaskJournal::new(dir.path());

        let path = journal.persist(&job("job-1")).await.unwrap();
        let body = std::fs::read_to_string(path).unwrap();

        assert!(body.contains("aptPackages:"));
        assert!(body.contains("name: job-1"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TaskJournal::new(dir.path());
        journal.persist(&job("job-1")).await.unwrap();

        journal.remove("job-1").await.unwrap();
        journal.remove("job-1").await.unwrap();

        assert!(journal.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TaskJournal::new(dir.path().join("absent"));

        assert!(journal.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TaskJournal::new(dir.path());

        assert!(matches!(
            journal.persist(&job("../x")).await,
            Err(JournalError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn replay_removes_only_successful_entries() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TaskJournal::new(dir.path());
        journal.persist(&job("a")).await.unwrap();
        journal.persist(&job("b")).await.unwrap();
        std::fs::write(dir.path().join("broken.yml"), "name: [unterminated").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let runner = RecordingRunner {
            fail: vec!["b".to_string()],
            ..Default::default()
        };
        let report = journal
            .sweep_and_replay(&runner, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report,
            ReplayReport {
                completed: 1,
                failed: 1,
                unreadable: 1
            }
        );
        assert_eq!(*runner.ran.lock().unwrap(), vec!["a", "b"]);
        let left: Vec<_> = journal
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec!["b.yml", "broken.yml"]);
    }
}
