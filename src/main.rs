use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use runq::core::{Orchestrator, QueueId};
use runq::{config, context, db, logging, shutdown};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "runq", version)]
#[command(about = "Run queued container jobs one at a time, then retire the instance", long_about = None)]
struct Cli {
    /// Queue name, or the project owning the queue when QUEUE is also given
    #[arg(value_name = "PROJECT|QUEUE")]
    first: String,

    /// Queue name
    #[arg(value_name = "QUEUE")]
    second: Option<String>,

    /// Configuration file (defaults to $RUNQ_CONFIG or /etc/runq/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    journal_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    queue_db: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    default_image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retry_attempts: Option<u32>,

    /// Keep the instance running after the queue is drained
    #[serde(skip)]
    #[arg(long)]
    no_self_terminate: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(skip)]
    self_terminate: Option<bool>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn queue(&self) -> Result<QueueId> {
        let queue = match &self.second {
            Some(queue) => QueueId::new(&self.first, queue),
            None => QueueId::new("", &self.first),
        };
        if queue.name.trim().is_empty() {
            bail!("Queue name must not be empty");
        }
        Ok(queue)
    }
}

/// Accept the single-dash `-version` older wrappers pass.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg: OsString = arg.into();
            if arg.to_str() == Some("-version") {
                OsString::from("--version")
            } else {
                arg
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures.
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(mut cli: Cli) -> Result<()> {
    let queue = cli.queue()?;

    if cli.overrides.no_self_terminate {
        cli.overrides.self_terminate = Some(false);
    }
    let config = match &cli.config {
        Some(path) => config::AppConfig::load(path, Some(&cli.overrides))?,
        None => config::AppConfig::new(Some(&cli.overrides))?,
    };

    logging::init(logging::LogConfig::from(&config));

    let db_conn = db::init(&config.queue_db)
        .await
        .with_context(|| format!("Failed to open queue database {}", config.queue_db.display()))?;
    let cancel = shutdown::install_shutdown_handler().context("Failed to install signal handlers")?;

    let ctx = context::AppContext::new(config, db_conn);
    Orchestrator::new(ctx, cancel)
        .start(&queue)
        .await
        .with_context(|| format!("Worker for queue {} failed", queue))?;

    Ok(())
}
