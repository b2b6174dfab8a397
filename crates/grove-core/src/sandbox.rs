//! The `Sandbox` abstraction and the types it exchanges with callers.

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Current state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxState {
    /// VM booting, executor connecting.
    Creating,
    /// Idle and accepting commands.
    Ready,
    /// Executing a command.
    Running,
    /// Paused; `start` brings it back to `Ready`.
    Stopped,
    /// Creating or restoring a snapshot.
    Snapshot,
    /// Terminal.
    Destroyed,
    /// An operation failed. Never returned to the idle pool.
    Error,
}

impl SandboxState {
    /// All states, in lifecycle order.
    pub const ALL: [SandboxState; 7] = [
        SandboxState::Creating,
        SandboxState::Ready,
        SandboxState::Running,
        SandboxState::Stopped,
        SandboxState::Snapshot,
        SandboxState::Destroyed,
        SandboxState::Error,
    ];
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Snapshot => "Snapshot",
            Self::Destroyed => "Destroyed",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// A command to run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Program and arguments. Not interpreted by a shell.
    pub command: Vec<String>,
    /// Working directory inside the guest.
    pub workdir: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Data written to the command's stdin.
    pub stdin: Option<String>,
    /// Overrides the sandbox's `exec_timeout` when set.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// Request for a program and its arguments.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Run `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["/bin/sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Set the working directory.
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set stdin.
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program name, if any.
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Effective timeout given the sandbox's default.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.filter(|t| !t.is_zero()).unwrap_or(default)
    }
}

/// Guest resource usage sampled around one command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Guest memory in use, MiB.
    pub memory_mb: f64,
    /// Guest CPU utilization, percent.
    pub cpu_percent: f64,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code (-1 if the process couldn't be started or was killed).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Resource samples.
    pub resource_usage: ResourceUsage,
    /// True when produced by the placeholder executor rather than a real guest.
    pub simulated: bool,
}

impl ExecutionResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Timings and counters owned by one sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    /// Time from construction to `Ready`.
    pub startup_time: Duration,
    /// Duration of the most recent snapshot.
    pub snapshot_time: Duration,
    /// Duration of the most recent restore.
    pub restore_time: Duration,
    /// Mean execution time across all commands.
    pub execution_time: Duration,
    /// Commands executed, including failed ones.
    pub execution_count: u64,
    /// Commands that returned real resource samples.
    pub sample_count: u64,
    /// Last sampled guest memory, MiB.
    pub memory_current_mb: f64,
    /// Highest sampled guest memory, MiB.
    pub memory_peak_mb: f64,
    /// Rolling mean CPU utilization, percent.
    pub cpu_avg_percent: f64,
    /// Bytes received by the guest.
    pub network_rx_bytes: u64,
    /// Bytes sent by the guest.
    pub network_tx_bytes: u64,
    /// Failed operations.
    pub error_count: u64,
    /// Number of `start` calls.
    pub restart_count: u64,
}

impl SandboxMetrics {
    /// Fold one command into the rolling figures.
    ///
    /// Resource samples from simulated results are ignored.
    pub fn record_execution(&mut self, duration: Duration, usage: Option<ResourceUsage>) {
        let n = self.execution_count;
        self.execution_count = n + 1;
        let total = self.execution_time.as_secs_f64() * n as f64 + duration.as_secs_f64();
        self.execution_time = Duration::from_secs_f64(total / (n + 1) as f64);

        if let Some(usage) = usage {
            let k = self.sample_count;
            self.sample_count = k + 1;
            self.memory_current_mb = usage.memory_mb;
            if usage.memory_mb > self.memory_peak_mb {
                self.memory_peak_mb = usage.memory_mb;
            }
            self.cpu_avg_percent = (self.cpu_avg_percent * k as f64 + usage.cpu_percent) / (k + 1) as f64;
        }
    }
}

/// Point-in-time projection of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Sandbox ID.
    pub id: SandboxId,
    /// Current state.
    pub state: SandboxState,
    /// Configuration the sandbox was built from.
    pub config: SandboxConfig,
    /// Metrics at the time of the call.
    pub metrics: SandboxMetrics,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a command or snapshot ran.
    pub last_used_at: DateTime<Utc>,
    /// Snapshot IDs in creation order.
    pub snapshots: Vec<String>,
}

/// One isolated execution environment.
///
/// Methods take `&self` and serialize on the implementation's own lock. A
/// sandbox is held by at most one caller at a time, so holding that lock
/// across I/O is fine.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Sandbox ID.
    fn id(&self) -> &SandboxId;

    /// Run a command. Requires `Ready`; there is no queuing.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;

    /// Capture VM state under `snapshot_id`. Requires `Ready`.
    async fn create_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Return to a previously created snapshot.
    async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Snapshot IDs in creation order.
    async fn list_snapshots(&self) -> Result<Vec<String>>;

    /// Point-in-time projection.
    async fn info(&self) -> Result<SandboxInfo>;

    /// Bring a stopped sandbox back to `Ready`.
    async fn start(&self) -> Result<()>;

    /// Park the sandbox, clearing transient state.
    async fn stop(&self) -> Result<()>;

    /// Release every resource. Idempotent and best-effort.
    async fn destroy(&self) -> Result<()>;
}

/// Shared handle to a sandbox.
pub type SandboxHandle = Arc<dyn Sandbox>;

/// Bookkeeping shared by the sandbox implementations. Lives behind each
/// sandbox's lock.
#[derive(Debug)]
pub(crate) struct SandboxRecord {
    pub id: SandboxId,
    pub config: SandboxConfig,
    pub state: SandboxState,
    pub metrics: SandboxMetrics,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub snapshots: Vec<String>,
}

impl SandboxRecord {
    pub fn new(id: SandboxId, config: SandboxConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            state: SandboxState::Creating,
            metrics: SandboxMetrics::default(),
            created_at: now,
            last_used_at: now,
            snapshots: Vec::new(),
        }
    }

    /// Fail unless the sandbox is in `expected`.
    pub fn require(&self, expected: SandboxState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(CoreError::InvalidState {
                sandbox_id: self.id.to_string(),
                operation,
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Fail unless `snapshot_id` was created by this sandbox.
    pub fn require_snapshot(&self, snapshot_id: &str) -> Result<()> {
        if !self.snapshots.iter().any(|s| s == snapshot_id) {
            return Err(CoreError::SnapshotNotFound {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            });
        }
        Ok(())
    }

    /// Fail if `snapshot_id` was already used.
    pub fn require_new_snapshot(&self, snapshot_id: &str) -> Result<()> {
        if self.snapshots.iter().any(|s| s == snapshot_id) {
            return Err(CoreError::SnapshotExists {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    /// Count a failed operation and move to `Error`.
    pub fn fail(&mut self) {
        self.metrics.error_count += 1;
        self.state = SandboxState::Error;
    }

    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id.clone(),
            state: self.state,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            snapshots: self.snapshots.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_id_display() {
        let id = SandboxId::new();
        let s = format!("{}", id);
        // UUID format: xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx
        assert_eq!(s.len(), 36);
        assert!(s.contains('-'));
    }

    #[test]
    fn test_sandbox_id_from_str() {
        let id = SandboxId::from("node-7");
        assert_eq!(id.as_str(), "node-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"node-7\"");
    }

    #[test]
    fn test_sandbox_state_display() {
        assert_eq!(format!("{}", SandboxState::Creating), "Creating");
        assert_eq!(format!("{}", SandboxState::Snapshot), "Snapshot");
        assert_eq!(format!("{}", SandboxState::Error), "Error");
    }

    #[test]
    fn test_execution_request_builder() {
        let req = ExecutionRequest::new(["python3", "-c", "print(1)"])
            .workdir("/work")
            .env("PYTHONUNBUFFERED", "1")
            .stdin("input")
            .timeout(Duration::from_secs(5));
        assert_eq!(req.program(), Some("python3"));
        assert_eq!(req.command.len(), 3);
        assert_eq!(req.workdir.as_deref(), Some("/work"));
        assert_eq!(req.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(req.effective_timeout(Duration::from_secs(30)), Duration::from_secs(5));
    }

    #[test]
    fn test_effective_timeout_falls_back() {
        let req = ExecutionRequest::shell("true");
        assert_eq!(req.command, vec!["/bin/sh", "-c", "true"]);
        assert_eq!(req.effective_timeout(Duration::from_secs(30)), Duration::from_secs(30));

        let req = ExecutionRequest::shell("true").timeout(Duration::ZERO);
        assert_eq!(req.effective_timeout(Duration::from_secs(30)), Duration::from_secs(30));
    }

    #[test]
    fn test_record_execution_rolls_averages() {
        let mut metrics = SandboxMetrics::default();
        metrics.record_execution(
            Duration::from_millis(100),
            Some(ResourceUsage { memory_mb: 64.0, cpu_percent: 10.0 }),
        );
        metrics.record_execution(
            Duration::from_millis(300),
            Some(ResourceUsage { memory_mb: 32.0, cpu_percent: 30.0 }),
        );
        assert_eq!(metrics.execution_count, 2);
        assert!((metrics.execution_time.as_secs_f64() - 0.2).abs() < 1e-6);
        assert_eq!(metrics.memory_current_mb, 32.0);
        assert_eq!(metrics.memory_peak_mb, 64.0);
        assert!((metrics.cpu_avg_percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_execution_ignores_missing_samples() {
        let mut metrics = SandboxMetrics::default();
        metrics.record_execution(Duration::from_millis(50), None);
        assert_eq!(metrics.execution_count, 1);
        assert_eq!(metrics.memory_peak_mb, 0.0);
        assert_eq!(metrics.cpu_avg_percent, 0.0);
    }

    #[test]
    fn test_record_require_state() {
        let mut record = SandboxRecord::new(SandboxId::from("sb"), SandboxConfig::default());
        assert!(record.require(SandboxState::Ready, "execute").is_err());
        record.state = SandboxState::Ready;
        assert!(record.require(SandboxState::Ready, "execute").is_ok());

        record.fail();
        assert_eq!(record.state, SandboxState::Error);
        assert_eq!(record.metrics.error_count, 1);
    }

    #[test]
    fn test_record_snapshot_lookup() {
        let mut record = SandboxRecord::new(SandboxId::from("sb"), SandboxConfig::default());
        assert!(matches!(
            record.require_snapshot("s1"),
            Err(CoreError::SnapshotNotFound { .. })
        ));
        record.snapshots.push("s1".into());
        assert!(record.require_snapshot("s1").is_ok());
        assert!(matches!(
            record.require_new_snapshot("s1"),
            Err(CoreError::SnapshotExists { .. })
        ));
    }
}
