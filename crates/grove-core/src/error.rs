//! Error types for grove-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for grove-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from grove-vm
    #[error("VM error: {0}")]
    Vm(#[from] grove_vm::VmError),

    /// VM lifecycle step failed for a specific sandbox
    #[error("sandbox {sandbox_id}: {operation} failed: {source}")]
    Lifecycle {
        /// Sandbox the operation ran against
        sandbox_id: String,
        /// Lifecycle step (create, start, stop, ...)
        operation: &'static str,
        /// Underlying failure
        #[source]
        source: Box<CoreError>,
    },

    /// Failed to connect to guest agent
    #[error("connection failed: {0}")]
    Connection(String),

    /// Agent did not respond in time
    #[error("agent timeout after {0:?}")]
    AgentTimeout(Duration),

    /// JSON-RPC error from agent
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the agent
        code: i32,
        /// Error message from the agent
        message: String,
    },

    /// Command did not finish within its timeout
    #[error("sandbox {sandbox_id}: execution timed out after {timeout:?}")]
    ExecutionTimeout {
        /// Sandbox the command ran in
        sandbox_id: String,
        /// Timeout that expired
        timeout: Duration,
    },

    /// Sandbox not found
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// Invalid sandbox state for operation
    #[error("sandbox {sandbox_id}: invalid state for {operation}: expected {expected}, got {actual}")]
    InvalidState {
        /// Sandbox whose state conflicted
        sandbox_id: String,
        /// Operation that was attempted
        operation: &'static str,
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Snapshot ID unknown to this sandbox
    #[error("sandbox {sandbox_id}: snapshot not found: {snapshot_id}")]
    SnapshotNotFound {
        /// Sandbox that was asked to restore
        sandbox_id: String,
        /// Requested snapshot
        snapshot_id: String,
    },

    /// Snapshot ID already used within this sandbox's lifetime
    #[error("sandbox {sandbox_id}: snapshot already exists: {snapshot_id}")]
    SnapshotExists {
        /// Sandbox that was asked to snapshot
        sandbox_id: String,
        /// Duplicate snapshot
        snapshot_id: String,
    },

    /// Snapshot write returned but an artifact is absent or empty
    #[error("sandbox {sandbox_id}: snapshot {snapshot_id} is missing an artifact: {detail}")]
    SnapshotMissingArtifact {
        /// Sandbox the snapshot belongs to
        sandbox_id: String,
        /// Snapshot involved
        snapshot_id: String,
        /// Which artifact and why
        detail: String,
    },

    /// Snapshot create/restore failed
    #[error("sandbox {sandbox_id}: snapshot {snapshot_id} failed: {message}")]
    Snapshot {
        /// Sandbox the snapshot belongs to
        sandbox_id: String,
        /// Snapshot involved
        snapshot_id: String,
        /// What went wrong
        message: String,
    },

    /// No sandbox became available before the deadline
    #[error("timed out after {0:?} waiting for a pooled sandbox")]
    PoolTimeout(Duration),

    /// Pool has been shut down
    #[error("sandbox pool is shut down")]
    PoolShutdown,

    /// External state-store subprocess failed
    #[error("state store {operation} failed: {message}{}", format_output(.output))]
    StateStore {
        /// Subcommand (init, commit, restore, stats)
        operation: &'static str,
        /// What went wrong
        message: String,
        /// Combined stdout+stderr captured from the subprocess
        output: String,
    },

    /// Call rejected without being attempted because the circuit is open
    #[error("circuit '{name}' is open; call not attempted")]
    CircuitOpen {
        /// Breaker name
        name: String,
    },

    /// All retry attempts failed
    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the last attempt
        #[source]
        source: Box<CoreError>,
    },

    /// Health sweep cleaned up sandboxes
    #[error("health check cleaned up {cleaned} unhealthy sandbox(es)")]
    UnhealthySandboxes {
        /// Number of sandboxes destroyed
        cleaned: usize,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wrap an error with the sandbox and lifecycle step it came from.
    pub fn lifecycle(sandbox_id: impl Into<String>, operation: &'static str, source: CoreError) -> Self {
        Self::Lifecycle {
            sandbox_id: sandbox_id.into(),
            operation,
            source: Box::new(source),
        }
    }

    /// True for the "not attempted" rejection of an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" (output: {trimmed})")
    }
}
