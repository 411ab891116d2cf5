//! The external extraction engine.
//!
//! The service never fetches or muxes media itself; it asks an [`Engine`] to
//! do so. [`YtDlpEngine`] runs `yt-dlp` as a child process per call.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::format::FormatSpec;

/// Upper bound on captured stderr. Only the tail is kept.
pub const MAX_CAPTURED_STDERR: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not installed. Install it and restart the backend.")]
    NotInstalled(String),

    #[error("Could not start the engine: {0}")]
    Spawn(String),

    #[error("Could not read engine metadata: {0}")]
    InvalidMetadata(String),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Path template with a `%(ext)s` placeholder the engine fills in.
    Template(String),
    Stdout,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub url: String,
    pub format: FormatSpec,
    pub output: OutputTarget,
    pub cookies_file: Option<PathBuf>,
}

impl Invocation {
    pub fn to_args(&self) -> Vec<String> {
        let streaming = self.output == OutputTarget::Stdout;
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
        ];
        args.extend(self.format.to_args(streaming));

        args.push("-o".to_string());
        args.push(match &self.output {
            OutputTarget::Template(template) => template.clone(),
            OutputTarget::Stdout => "-".to_string(),
        });

        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.push("--".to_string());
        args.push(self.url.clone());
        args
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExitOutcome {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stderr: Vec<u8>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running engine whose primary output is piped to the caller.
pub struct EngineStream {
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    /// Resolves once the process has exited, after stdout is closed.
    pub exit: oneshot::Receiver<ExitOutcome>,
    /// Cancelling kills the process.
    pub cancel: CancellationToken,
}

/// Descriptive fields as reported by the engine's JSON dump.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadata {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub duration: Option<f64>,
    pub extractor_key: Option<String>,
    pub extractor: Option<String>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn extract_metadata(
        &self,
        url: &str,
        cookies_file: Option<&Path>,
    ) -> Result<RawMetadata, EngineError>;

    /// Runs to completion, writing the artifact to the invocation's template.
    /// Dropping the returned future must stop the engine.
    async fn run(&self, invocation: &Invocation) -> Result<ExitOutcome, EngineError>;

    async fn spawn_stream(&self, invocation: &Invocation) -> Result<EngineStream, EngineError>;
}

pub struct YtDlpEngine {
    program: PathBuf,
}

impl YtDlpEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn(&self, mut command: Command) -> Result<Child, EngineError> {
        command.spawn().map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                EngineError::NotInstalled(self.program.to_string_lossy().into_owned())
            } else {
                EngineError::Spawn(error.to_string())
            }
        })
    }
}

#[async_trait]
impl Engine for YtDlpEngine {
    async fn extract_metadata(
        &self,
        url: &str,
        cookies_file: Option<&Path>,
    ) -> Result<RawMetadata, EngineError> {
        let mut command = self.command();
        command.args(["-J", "--no-playlist", "--no-warnings"]);
        if let Some(cookies) = cookies_file {
            command.arg("--cookies").arg(cookies);
        }
        command
            .arg("--")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = self.spawn(command)?.wait_with_output().await?;
        if !output.status.success() {
            return Err(EngineError::InvalidMetadata(last_line(
                &output.stderr,
                "the engine could not read this URL",
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|error| EngineError::InvalidMetadata(error.to_string()))
    }

    async fn run(&self, invocation: &Invocation) -> Result<ExitOutcome, EngineError> {
        let mut command = self.command();
        command
            .args(invocation.to_args())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = self.spawn(command)?;
        debug!("Engine started with pid {:?}", child.id());

        let stderr = match child.stderr.take() {
            Some(stderr) => read_bounded_tail(stderr, MAX_CAPTURED_STDERR).await?,
            None => Vec::new(),
        };
        let status = child.wait().await?;

        Ok(ExitOutcome {
            code: status.code(),
            stderr,
        })
    }

    async fn spawn_stream(&self, invocation: &Invocation) -> Result<EngineStream, EngineError> {
        let mut command = self.command();
        command
            .args(invocation.to_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.spawn(command)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("missing stdout pipe".to_string()))?;
        let stderr = child.stderr.take();

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let waiter_cancel = cancel.clone();

        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                match stderr {
                    Some(stderr) => read_bounded_tail(stderr, MAX_CAPTURED_STDERR)
                        .await
                        .unwrap_or_default(),
                    None => Vec::new(),
                }
            });

            let code = tokio::select! {
                () = waiter_cancel.cancelled() => {
                    if let Err(error) = child.kill().await {
                        warn!("Could not kill engine process: {error}");
                    }
                    None
                }
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(error) => {
                        warn!("Error waiting for engine process: {error}");
                        None
                    }
                },
            };

            let stderr = stderr_task.await.unwrap_or_default();
            let _ = exit_tx.send(ExitOutcome { code, stderr });
        });

        Ok(EngineStream {
            stdout: Box::pin(stdout),
            exit: exit_rx,
            cancel,
        })
    }
}

/// Drains `reader` to EOF while keeping only its last `limit` bytes.
pub async fn read_bounded_tail<R>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::with_capacity(limit.min(4096));
    let mut chunk = [0_u8; 4096];

    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
        }
    }

    Ok(tail)
}

fn last_line(stderr: &[u8], fallback: &str) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or(fallback)
        .to_string()
}
