//! Error types for grove-vm.

use crate::machine::VmState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for grove-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors raised while driving a Firecracker microVM.
#[derive(Debug, Error)]
pub enum VmError {
    /// Machine configuration rejected before anything was spawned
    #[error("invalid machine config: {0}")]
    Config(String),

    /// Firecracker did not come up
    #[error("vm {vm_id}: boot failed during {stage}: {message}")]
    Boot {
        vm_id: String,
        /// `create` (process + config) or `start` (InstanceStart)
        stage: &'static str,
        message: String,
    },

    /// Operation not allowed in the VM's current state
    #[error("vm {vm_id}: cannot {operation} while {state}")]
    InvalidState {
        vm_id: String,
        operation: &'static str,
        state: VmState,
    },

    /// Spawning, signalling or killing the Firecracker process failed
    #[error("vm {vm_id}: process {action} failed: {message}")]
    Process {
        vm_id: String,
        action: &'static str,
        message: String,
    },

    /// API socket unreachable or the request could not be built
    #[error("firecracker API {method} {path} unreachable: {message}")]
    Transport {
        method: String,
        path: String,
        message: String,
    },

    /// API socket answered with a non-success status
    #[error("firecracker API {method} {path} failed with status {status}: {body}")]
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// Snapshot artifact absent or empty
    #[error("snapshot artifact {}: {reason}", .path.display())]
    Artifact { path: PathBuf, reason: String },

    /// Instance or snapshot ID unusable as a path component
    #[error("invalid {kind} id {id:?}")]
    InvalidId { kind: &'static str, id: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_names_vm_and_state() {
        let err = VmError::InvalidState {
            vm_id: "vm-1".into(),
            operation: "resume",
            state: VmState::Running,
        };
        assert_eq!(err.to_string(), "vm vm-1: cannot resume while running");
    }

    #[test]
    fn test_artifact_error_shows_path() {
        let err = VmError::Artifact {
            path: PathBuf::from("/snap/vm-1/s1.mem"),
            reason: "empty".into(),
        };
        assert_eq!(err.to_string(), "snapshot artifact /snap/vm-1/s1.mem: empty");
    }
}
