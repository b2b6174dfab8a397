//! A sandbox paired with a filesystem state store.
//!
//! One logical snapshot is a state-store commit plus a VM snapshot:
//!
//! ```text
//! snapshot(id):  store.commit("grove-<id>")  ──▶  vm.create_snapshot(id)
//!                 (best effort, warns)              (required)
//!
//! restore(id):   vm.restore_snapshot(id)     ──▶  store.restore("grove-<id>")
//!                 (required)                        (best effort, warns)
//! ```
//!
//! The store-side reference is a pure function of the caller's ID, so any
//! wrapper over the same sandbox and store can restore both layers.
//!
//! The VM layer is authoritative. A missing or failed state-store layer
//! degrades replay fidelity but never fails the operation.

use crate::error::{CoreError, Result};
use crate::sandbox::{ExecutionRequest, ExecutionResult, Sandbox, SandboxHandle, SandboxId, SandboxInfo};
use crate::state_store::{OperationMetrics, StateStoreClient};
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Prefix of the commit message recorded in the state store.
pub const COMMIT_MESSAGE_PREFIX: &str = "grove-";

/// State-store reference for the snapshot the caller named `snapshot_id`.
///
/// Used as the commit message on snapshot and as the restore target.
pub fn state_store_ref(snapshot_id: &str) -> String {
    format!("{COMMIT_MESSAGE_PREFIX}{snapshot_id}")
}

/// Outcome of [`CombinedSandbox::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedSnapshot {
    pub snapshot_id: String,
    /// ID the store assigned to the commit, absent when the commit failed.
    pub state_snapshot_id: Option<String>,
    pub state_metrics: Option<OperationMetrics>,
    pub vm_duration: Duration,
    /// Downgraded state-store failures.
    pub warnings: Vec<String>,
}

/// Outcome of [`CombinedSandbox::restore`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedRestore {
    pub snapshot_id: String,
    pub state_metrics: Option<OperationMetrics>,
    pub vm_duration: Duration,
    pub warnings: Vec<String>,
}

/// A [`Sandbox`] whose snapshots also capture filesystem state.
pub struct CombinedSandbox {
    sandbox: SandboxHandle,
    store: StateStoreClient,
}

impl CombinedSandbox {
    pub fn new(sandbox: SandboxHandle, store: StateStoreClient) -> Self {
        Self { sandbox, store }
    }

    /// The wrapped sandbox.
    pub fn inner(&self) -> &SandboxHandle {
        &self.sandbox
    }

    pub fn store(&self) -> &StateStoreClient {
        &self.store
    }

    /// Commit filesystem state, then snapshot the VM.
    pub async fn snapshot(&self, snapshot_id: &str) -> Result<CombinedSnapshot> {
        let id = self.sandbox.id();
        // a duplicate would leave an orphaned commit behind
        if self.sandbox.list_snapshots().await?.iter().any(|s| s == snapshot_id) {
            return Err(CoreError::SnapshotExists {
                sandbox_id: id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            });
        }

        let mut warnings = Vec::new();
        let state_ref = state_store_ref(snapshot_id);
        let (state_snapshot_id, state_metrics) = match self.store.commit(&state_ref).await {
            Ok((state_id, metrics)) => (Some(state_id), Some(metrics)),
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %id,
                    snapshot_id,
                    error = %e,
                    "State store commit failed, continuing with VM snapshot only"
                );
                warnings.push(format!("state store commit failed: {e}"));
                (None, None)
            }
        };

        let started = Instant::now();
        self.sandbox.create_snapshot(snapshot_id).await?;
        let vm_duration = started.elapsed();

        tracing::info!(
            sandbox_id = %id,
            snapshot_id,
            state_snapshot_id = state_snapshot_id.as_deref().unwrap_or("-"),
            elapsed_ms = vm_duration.as_millis() as u64,
            "Combined snapshot created"
        );
        Ok(CombinedSnapshot {
            snapshot_id: snapshot_id.to_string(),
            state_snapshot_id,
            state_metrics,
            vm_duration,
            warnings,
        })
    }

    /// Restore the VM, then the filesystem state.
    pub async fn restore(&self, snapshot_id: &str) -> Result<CombinedRestore> {
        let id = self.sandbox.id();
        let started = Instant::now();
        self.sandbox.restore_snapshot(snapshot_id).await?;
        let vm_duration = started.elapsed();

        let mut warnings = Vec::new();
        let state_metrics = match self.store.restore_snapshot(&state_store_ref(snapshot_id)).await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %id,
                    snapshot_id,
                    error = %e,
                    "State store restore failed, VM state is still valid"
                );
                warnings.push(format!("state store restore failed: {e}"));
                None
            }
        };

        tracing::info!(
            sandbox_id = %id,
            snapshot_id,
            elapsed_ms = vm_duration.as_millis() as u64,
            "Combined snapshot restored"
        );
        Ok(CombinedRestore {
            snapshot_id: snapshot_id.to_string(),
            state_metrics,
            vm_duration,
            warnings,
        })
    }
}

#[async_trait]
impl Sandbox for CombinedSandbox {
    fn id(&self) -> &SandboxId {
        self.sandbox.id()
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.sandbox.execute(request).await
    }

    async fn create_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.snapshot(snapshot_id).await.map(|_| ())
    }

    async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.restore(snapshot_id).await.map(|_| ())
    }

    async fn list_snapshots(&self) -> Result<Vec<String>> {
        self.sandbox.list_snapshots().await
    }

    async fn info(&self) -> Result<SandboxInfo> {
        self.sandbox.info().await
    }

    async fn start(&self) -> Result<()> {
        self.sandbox.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.sandbox.stop().await
    }

    async fn destroy(&self) -> Result<()> {
        self.sandbox.destroy().await
    }
}
