use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, info};

use super::{ContainerError, ContainerRuntime};

/// Container runtime backed by the `docker` command-line client.
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    fn spawn(&self, args: &[&str], stdout: Stdio) -> Result<Child, ContainerError> {
        debug!(command = %self.describe(args), "Spawning docker");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                program: self.binary.display().to_string(),
                source,
            })
    }

    /// Run a docker command to completion, feeding `input` on stdin, and
    /// return its stdout.
    async fn output(&self, args: &[&str], input: &[u8]) -> Result<String, ContainerError> {
        let command = self.describe(args);
        let io_err = |source| ContainerError::Io {
            command: command.clone(),
            source,
        };

        let mut child = self.spawn(args, Stdio::piped())?;
        feed_stdin(&mut child, input).await.map_err(io_err)?;

        let output = child.wait_with_output().await.map_err(io_err)?;
        if !output.status.success() {
            return Err(ContainerError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Write `input` to the child's stdin, then close it to send EOF.
///
/// A child that exits before reading everything closes the pipe; that is left
/// for its exit status to report.
async fn feed_stdin(child: &mut Child, input: &[u8]) -> std::io::Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(input).await {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            result => result?,
        }
    }
    Ok(())
}

/// Forward a child's output to the log, one line at a time.
fn forward_lines<R>(reader: R, name: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(container = %name, stream, "{}", line);
        }
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(&self, tag: &str, dockerfile: &[u8]) -> Result<(), ContainerError> {
        // `-` reads the Dockerfile from stdin with an empty build context.
        self.output(&["build", "-t", tag, "-"], dockerfile).await?;
        Ok(())
    }

    async fn lookup(&self, name: &str) -> Result<Option<String>, ContainerError> {
        // The filter is a regex; names may contain `.`.
        let filter = format!("name=^/{}$", regex::escape(name));
        let out = self.output(&["ps", "-aq", "--filter", &filter], b"").await?;

        Ok(out
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        self.output(&["rm", "-f", "-v", id], b"").await?;
        Ok(())
    }

    async fn run(&self, tag: &str, name: &str, payload: &[u8]) -> Result<(), ContainerError> {
        let args = ["run", "-i", "--name", name, tag];
        let command = self.describe(&args);
        let io_err = |source| ContainerError::Io {
            command: command.clone(),
            source,
        };

        let mut child = self.spawn(&args, Stdio::piped())?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, name.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, name.to_string(), "stderr"));
        }

        feed_stdin(&mut child, payload).await.map_err(io_err)?;

        let status = child.wait().await.map_err(io_err)?;
        for reader in readers {
            let _ = reader.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(ContainerError::Exited {
                name: name.to_string(),
                code: status.code(),
            })
        }
    }
}
