//! Turns a [`Job`] into the two artifacts the container runtime needs: a
//! Dockerfile for the job image and an entrypoint script streamed to the
//! container on stdin.

use thiserror::Error;

use super::models::{ArchiveKind, DownloadSpec, Job};
use super::url_resolver::{self, ResolveError};

const DOCKERFILE_TEMPLATE: &str = include_str!("../../assets/Dockerfile");
const ENTRYPOINT_TEMPLATE: &str = include_str!("../../assets/entrypoint.sh");

const OBJECT_STORE_SCHEME: &str = "gs://";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid job name {0:?}")]
    InvalidName(String),
    #[error("invalid {field} {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("template {template}: {reason}")]
    Template {
        template: &'static str,
        reason: String,
    },
}

/// Rendered build and run artifacts for one job.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub dockerfile: Vec<u8>,
    pub entrypoint: Vec<u8>,
}

/// How one input gets into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStep {
    /// Clone a repository into the working directory.
    Vcs { url: String },
    /// Copy with the object store's own tooling.
    ObjectStore(DownloadSpec),
    /// Plain HTTP(S) download.
    Generic(DownloadSpec),
}

impl FetchStep {
    pub fn for_source(spec: &str) -> Result<Self, ResolveError> {
        if is_vcs_url(spec) {
            return Ok(Self::Vcs {
                url: spec.to_string(),
            });
        }
        Self::for_data(spec)
    }

    pub fn for_data(spec: &str) -> Result<Self, ResolveError> {
        let resolved = url_resolver::resolve(spec)?;
        if spec.starts_with(OBJECT_STORE_SCHEME) {
            Ok(Self::ObjectStore(resolved))
        } else {
            Ok(Self::Generic(resolved))
        }
    }

    fn script(&self) -> String {
        match self {
            Self::Vcs { url } => format!("git clone {} . < /dev/null\n", quote(url)),
            Self::ObjectStore(spec) => {
                let copy = format!(
                    "gsutil -m cp -r {} {} < /dev/null",
                    quote(&spec.source),
                    quote(&spec.destination)
                );
                with_expansion(spec, &copy)
            }
            Self::Generic(spec) => {
                let copy = format!(
                    "curl -fsSL -o {} {} < /dev/null",
                    quote(&spec.destination),
                    quote(&spec.source)
                );
                with_expansion(spec, &copy)
            }
        }
    }
}

fn is_vcs_url(spec: &str) -> bool {
    spec.ends_with(".git") || spec.starts_with("git://") || spec.starts_with("git@")
}

fn with_expansion(spec: &DownloadSpec, copy: &str) -> String {
    let dest = quote(&spec.destination);
    let mut script = format!("mkdir -p \"$(dirname {dest})\"\n{copy}\n");

    let unpack = match spec.archive {
        ArchiveKind::None => return script,
        ArchiveKind::Zip => format!("unzip -o {dest} -d \"$(dirname {dest})\""),
        ArchiveKind::Tar => format!("tar -xf {dest} -C \"$(dirname {dest})\""),
        ArchiveKind::TarGz => format!("tar -zxf {dest} -C \"$(dirname {dest})\""),
    };
    script.push_str(&format!("{unpack} < /dev/null\nrm -f {dest}\n"));
    script
}

/// Everything the entrypoint needs, classified but not yet rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrypointSteps {
    pub fetch: Vec<FetchStep>,
    pub run: Vec<String>,
    /// Upload directory, always ending with `/`.
    pub result: Option<String>,
    pub upload: Vec<String>,
}

impl EntrypointSteps {
    pub fn from_job(job: &Job) -> Result<Self, ResolveError> {
        let mut fetch = Vec::with_capacity(job.data.len() + 1);
        if let Some(source) = job.source() {
            fetch.push(FetchStep::for_source(source)?);
        }
        for data in &job.data {
            fetch.push(FetchStep::for_data(data)?);
        }

        let result = job.result().map(|r| {
            if r.ends_with('/') {
                r.to_string()
            } else {
                format!("{r}/")
            }
        });

        Ok(Self {
            fetch,
            run: job.run.clone(),
            result,
            upload: job.upload.clone(),
        })
    }

    fn fetch_script(&self) -> String {
        self.fetch.iter().map(FetchStep::script).collect()
    }

    fn run_script(&self) -> String {
        self.run
            .iter()
            .enumerate()
            .map(|(i, cmd)| {
                format!(
                    "if [ \"$status\" -eq 0 ]; then\n  sh -c {} > /tmp/stdout{i}.txt 2>&1 < /dev/null\n  status=$?\nfi\n",
                    quote(cmd)
                )
            })
            .collect()
    }

    fn upload_script(&self) -> String {
        let Some(result) = &self.result else {
            return String::new();
        };

        let push = if result.starts_with(OBJECT_STORE_SCHEME) {
            format!("gsutil cp \"$f\" {} < /dev/null", quote(result))
        } else {
            format!("curl -fsS -T \"$f\" {} < /dev/null", quote(result))
        };

        // Patterns stay unquoted so the shell expands them.
        let mut sources = vec!["/tmp/stdout*.txt".to_string()];
        sources.extend(self.upload.iter().cloned());

        format!(
            "for f in {}; do\n  [ -e \"$f\" ] || continue\n  {push} || status=$?\ndone\n",
            sources.join(" ")
        )
    }
}

/// Builds execution plans, filling in the default image when a job has none.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    default_image: String,
}

impl PlanBuilder {
    pub fn new(default_image: impl Into<String>) -> Self {
        Self {
            default_image: default_image.into(),
        }
    }

    pub fn build(&self, job: &Job) -> Result<ExecutionPlan, PlanError> {
        if !Job::is_valid_name(&job.name) {
            return Err(PlanError::InvalidName(job.name.clone()));
        }

        let dockerfile = self.dockerfile(job)?;
        let steps = EntrypointSteps::from_job(job)?;
        let (fetch, run, upload) = (steps.fetch_script(), steps.run_script(), steps.upload_script());
        let entrypoint = render(
            "entrypoint.sh",
            ENTRYPOINT_TEMPLATE,
            &[
                ("name", job.name.as_str()),
                ("fetch", fetch.as_str()),
                ("run", run.as_str()),
                ("upload", upload.as_str()),
            ],
        )?;

        Ok(ExecutionPlan {
            dockerfile: dockerfile.into_bytes(),
            entrypoint: entrypoint.into_bytes(),
        })
    }

    pub fn image_for<'a>(&'a self, job: &'a Job) -> &'a str {
        job.image
            .as_deref()
            .filter(|i| !i.trim().is_empty())
            .unwrap_or(self.default_image.as_str())
    }

    fn dockerfile(&self, job: &Job) -> Result<String, PlanError> {
        let image = self.image_for(job);
        if image.chars().any(char::is_whitespace) {
            return Err(PlanError::InvalidField {
                field: "image",
                value: image.to_string(),
            });
        }

        let mut apt = String::new();
        if !job.apt_packages.is_empty() {
            apt.push_str("ENV DEBIAN_FRONTEND=noninteractive\nRUN apt-get update\n");
            for package in &job.apt_packages {
                if !is_valid_package(package) {
                    return Err(PlanError::InvalidField {
                        field: "apt package",
                        value: package.clone(),
                    });
                }
                apt.push_str(&format!(
                    "RUN apt-get install -y --no-install-recommends {package}\n"
                ));
            }
        }

        render(
            "Dockerfile",
            DOCKERFILE_TEMPLATE,
            &[("image", image), ("apt", apt.as_str())],
        )
    }
}

fn is_valid_package(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | ':' | '=' | '~' | '_'))
}

/// Single-quote a string for bash.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Substitutes `{{key}}` placeholders in one pass, so substituted values are
/// never rescanned.
fn render(template_name: &'static str, template: &str, vars: &[(&str, &str)]) -> Result<String, PlanError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| PlanError::Template {
            template: template_name,
            reason: "unclosed placeholder".to_string(),
        })?;

        let key = after[..end].trim();
        let value = vars
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or_else(|| PlanError::Template {
                template: template_name,
                reason: format!("no value for placeholder {key:?}"),
            })?;

        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}
