use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static JOB_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]+(?:(?:\.|_|__|-+)[A-Za-z0-9]+)*$").expect("job name pattern is valid")
});

/// One unit of declarative work, as stored in the queue and in the journal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Container name and journal file stem. Stable across retries.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, alias = "apt", skip_serializing_if = "Vec::is_empty")]
    pub apt_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload: Vec<String>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A name must be usable as a container name, as a file stem and, once
    /// lowercased, as an image repository component: alphanumeric runs joined
    /// by a single `.`, one or two `_`, or any number of `-`.
    pub fn is_valid_name(name: &str) -> bool {
        JOB_NAME.is_match(name)
    }

    /// Source with empty strings treated as absent.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// How a downloaded file is unpacked after the fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveKind {
    #[default]
    None,
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    /// Infer the archive format from a destination file name.
    pub fn infer(destination: &str) -> Self {
        if destination.ends_with(".zip") {
            Self::Zip
        } else if destination.ends_with(".tar.gz") {
            Self::TarGz
        } else if destination.ends_with(".tar") {
            Self::Tar
        } else {
            Self::None
        }
    }
}

/// Parsed form of one extended URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub source: String,
    pub destination: String,
    pub archive: ArchiveKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names() {
        assert!(Job::is_valid_name("instance-1"));
        assert!(Job::is_valid_name("a.b_c"));
        assert!(!Job::is_valid_name(""));
        assert!(!Job::is_valid_name("-leading"));
        assert!(!Job::is_valid_name("../escape"));
        assert!(!Job::is_valid_name("has space"));
    }

    #[test]
    fn names_must_form_image_repository_components() {
        assert!(Job::is_valid_name("Build-2"));
        assert!(Job::is_valid_name("a--b"));
        assert!(Job::is_valid_name("a__b"));
        for name in ["job-", "job.", "job_", "a.-b", "a..b", "a._b", "a___b"] {
            assert!(!Job::is_valid_name(name), "{name} accepted");
        }
    }

    #[test]
    fn apt_alias_is_accepted() {
        let job: Job = serde_json::from_str(r#"{"name":"j","apt":["curl"]}"#).unwrap();
        assert_eq!(job.apt_packages, vec!["curl".to_string()]);

        let job: Job = serde_json::from_str(r#"{"name":"j","aptPackages":["git"]}"#).unwrap();
        assert_eq!(job.apt_packages, vec!["git".to_string()]);
    }

    #[test]
    fn empty_source_is_absent() {
        let mut job = Job::new("j");
        job.source = Some("  ".to_string());
        assert!(job.source().is_none());
    }

    #[test]
    fn tar_gz_wins_over_tar() {
        assert_eq!(ArchiveKind::infer("x.tar.gz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::infer("x.tar"), ArchiveKind::Tar);
        assert_eq!(ArchiveKind::infer("x.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::infer("x.gz"), ArchiveKind::None);
    }
}
