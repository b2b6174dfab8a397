//! Client for the external filesystem state store.
//!
//! The store is a separate binary that commits and restores the contents of
//! a working directory. Every operation is one subprocess call:
//!
//! ```text
//! <binary> init    --work <dir>
//! <binary> commit  --work <dir> --message <text>   -> {"snapshot_id": "..."}
//! <binary> restore --work <dir> --id <snapshot_id>
//! <binary> stats   --work <dir>                    -> free-form text
//! ```
//!
//! Process spawning sits behind [`CommandRunner`] so tests can script the
//! store's replies.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Captured result of one subprocess.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Runs an external program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. Must kill the process and return
    /// [`io::ErrorKind::TimedOut`] once `timeout` expires.
    async fn run(&self, program: &Path, args: &[String], cwd: Option<&Path>, timeout: Duration)
        -> io::Result<CommandOutput>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> io::Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        // dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} timed out after {timeout:?}", program.display()),
                ))
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// State store location and limits.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Store binary.
    /// Default: `helios` (resolved through `PATH`)
    pub binary: PathBuf,
    /// Directory the store tracks, passed as `--work`.
    pub work_dir: PathBuf,
    /// Limit for a single invocation.
    /// Default: 60 seconds
    pub timeout: Duration,
}

impl StateStoreConfig {
    pub fn new(binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Wall-clock cost of one store operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub operation: &'static str,
    pub duration: Duration,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    snapshot_id: Option<String>,
}

/// Drives the state-store binary.
///
/// No retries happen here; wrap calls in a
/// [`RetryPolicy`](crate::retry::RetryPolicy) when needed.
#[derive(Clone)]
pub struct StateStoreClient {
    config: StateStoreConfig,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for StateStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStoreClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StateStoreClient {
    /// Client spawning real processes.
    pub fn new(config: StateStoreConfig) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner))
    }

    /// Client using `runner` for every invocation.
    pub fn with_runner(config: StateStoreConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    /// Prepare the working directory for tracking.
    pub async fn initialize(&self) -> Result<OperationMetrics> {
        let (_, metrics) = self.invoke("init", &[]).await?;
        tracing::info!(
            work_dir = %self.config.work_dir.display(),
            elapsed_ms = metrics.duration.as_millis() as u64,
            "State store initialized"
        );
        Ok(metrics)
    }

    /// Commit the working directory. Returns the store's snapshot ID.
    ///
    /// A reply without a non-empty `snapshot_id` is an error.
    pub async fn commit(&self, message: &str) -> Result<(String, OperationMetrics)> {
        let args = ["--message".to_string(), message.to_string()];
        let (output, metrics) = self.invoke("commit", &args).await?;
        let snapshot_id = parse_commit(&output)?;
        tracing::debug!(
            snapshot_id = %snapshot_id,
            elapsed_ms = metrics.duration.as_millis() as u64,
            "State store commit"
        );
        Ok((snapshot_id, metrics))
    }

    /// Restore the working directory to `snapshot_id`, passed through as
    /// `--id`. [`CombinedSandbox`](crate::CombinedSandbox) passes the
    /// reference it committed under.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<OperationMetrics> {
        if snapshot_id.trim().is_empty() {
            return Err(CoreError::StateStore {
                operation: "restore",
                message: "empty snapshot id".into(),
                output: String::new(),
            });
        }
        let args = ["--id".to_string(), snapshot_id.to_string()];
        let (_, metrics) = self.invoke("restore", &args).await?;
        tracing::debug!(
            snapshot_id,
            elapsed_ms = metrics.duration.as_millis() as u64,
            "State store restore"
        );
        Ok(metrics)
    }

    /// The store's statistics report, verbatim.
    pub async fn stats(&self) -> Result<String> {
        let (output, _) = self.invoke("stats", &[]).await?;
        if output.stdout.trim().is_empty() {
            return Err(CoreError::StateStore {
                operation: "stats",
                message: "empty output".into(),
                output: output.combined(),
            });
        }
        Ok(output.stdout)
    }

    async fn invoke(&self, operation: &'static str, extra: &[String]) -> Result<(CommandOutput, OperationMetrics)> {
        let mut args = vec![
            operation.to_string(),
            "--work".to_string(),
            self.config.work_dir.display().to_string(),
        ];
        args.extend_from_slice(extra);
        tracing::trace!(binary = %self.config.binary.display(), ?args, "Invoking state store");

        let started = Instant::now();
        let result = self
            .runner
            .run(&self.config.binary, &args, None, self.config.timeout)
            .await;
        let metrics = OperationMetrics {
            operation,
            duration: started.elapsed(),
        };

        let output = result.map_err(|e| CoreError::StateStore {
            operation,
            message: match e.kind() {
                io::ErrorKind::TimedOut => format!("timed out after {:?}", self.config.timeout),
                _ => format!("failed to run {}: {e}", self.config.binary.display()),
            },
            output: String::new(),
        })?;

        if !output.success() {
            let status = output
                .status
                .map(|code| format!("exit status {code}"))
                .unwrap_or_else(|| "terminated by signal".to_string());
            return Err(CoreError::StateStore {
                operation,
                message: status,
                output: output.combined(),
            });
        }
        Ok((output, metrics))
    }
}

/// Extract the snapshot ID from a commit reply.
///
/// Accepts a bare JSON object, or log lines followed by the object on the
/// last non-empty line.
fn parse_commit(output: &CommandOutput) -> Result<String> {
    let stdout = output.stdout.trim();
    let fail = |message: String| CoreError::StateStore {
        operation: "commit",
        message,
        output: output.combined(),
    };
    if stdout.is_empty() {
        return Err(fail("empty output".into()));
    }

    let response: CommitResponse = match serde_json::from_str(stdout) {
        Ok(r) => r,
        Err(whole) => {
            let last = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default();
            serde_json::from_str(last.trim()).map_err(|_| fail(format!("malformed response: {whole}")))?
        }
    };

    match response.snapshot_id {
        Some(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => Err(fail("response has no snapshot_id".into())),
    }
}
