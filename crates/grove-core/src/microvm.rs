//! Firecracker-backed sandbox.

use crate::config::{ExecutionStrategy, NetworkMode, SandboxConfig};
use crate::error::{CoreError, Result};
use crate::executor::{AgentExecutor, CommandExecutor, SimulatedExecutor};
use crate::sandbox::{
    ExecutionRequest, ExecutionResult, Sandbox, SandboxId, SandboxInfo, SandboxRecord, SandboxState,
};
use async_trait::async_trait;
use grove_vm::{instance_dir, SnapshotPaths, VirtualMachine, VmBuilder, VmState, VsockConfig};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Time the guest gets to act on Ctrl-Alt-Del before the process is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// A sandbox running in its own Firecracker microVM.
///
/// Stop pauses the vCPUs and start resumes them, so a pooled instance keeps
/// its booted guest between holders.
pub struct MicroVmSandbox {
    id: SandboxId,
    inner: Mutex<Inner>,
}

struct Inner {
    record: SandboxRecord,
    vm: Option<VirtualMachine>,
    executor: Box<dyn CommandExecutor>,
}

impl MicroVmSandbox {
    /// Boot a microVM and connect its executor.
    ///
    /// This will:
    /// 1. Resolve and validate the configuration
    /// 2. Create and boot the VM under the sandbox ID
    /// 3. Connect to the guest agent (or set up the simulated executor)
    ///
    /// Nothing is left behind on failure.
    pub async fn create(config: SandboxConfig) -> Result<Self> {
        let config = config.resolved();
        config.validate()?;
        config.validate_boot_artifacts()?;
        if config.vsock_cid == 0 {
            return Err(CoreError::Config("vsock_cid must be assigned before boot".into()));
        }

        let id = SandboxId::from(config.vm_id.clone());
        let start = Instant::now();
        tracing::info!(
            sandbox_id = %id,
            vcpus = config.vcpu_count,
            memory_mb = config.memory_mb,
            vsock_cid = config.vsock_cid,
            "Creating sandbox"
        );

        let vm_dir = config.chroot_path.join(id.as_str());
        tokio::fs::create_dir_all(&vm_dir).await.map_err(|e| {
            tracing::error!(sandbox_id = %id, error = %e, "Failed to create sandbox directory");
            CoreError::lifecycle(id.as_str(), "create", e.into())
        })?;

        let mut builder = VmBuilder::new()
            .vcpus(config.vcpu_count)
            .memory_mib(config.memory_mb)
            .kernel(&config.kernel_path)
            .rootfs(&config.rootfs_path)
            .firecracker_path(&config.firecracker_path)
            .chroot_path(&config.chroot_path)
            .with_vsock_config(VsockConfig {
                guest_cid: config.vsock_cid,
                uds_path: config.socket_path.clone(),
            });
        if let Some(NetworkMode::Tap { host_dev }) = &config.network {
            builder = builder.with_network(host_dev);
        }

        let vm = match builder.build_with_id(id.as_str()).await {
            Ok(vm) => vm,
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "VM creation failed");
                remove_dir(&id, &vm_dir).await;
                return Err(CoreError::lifecycle(id.as_str(), "create", e.into()));
            }
        };
        tracing::debug!(
            sandbox_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM created and started"
        );

        let executor: Box<dyn CommandExecutor> = match config.execution_strategy() {
            ExecutionStrategy::Agent => match AgentExecutor::connect(id.as_str(), &config.socket_path).await {
                Ok(executor) => Box::new(executor),
                Err(e) => {
                    tracing::error!(sandbox_id = %id, error = %e, "Agent connection failed");
                    if let Err(e) = vm.destroy().await {
                        tracing::warn!(sandbox_id = %id, error = %e, "Failed to destroy VM after agent failure");
                    }
                    remove_dir(&id, &vm_dir).await;
                    return Err(CoreError::lifecycle(id.as_str(), "connect", e));
                }
            },
            ExecutionStrategy::Simulated => {
                tracing::warn!(
                    sandbox_id = %id,
                    "Sandbox uses the simulated executor; command results are not real"
                );
                Box::new(SimulatedExecutor::new(id.as_str()))
            }
        };

        let mut record = SandboxRecord::new(id.clone(), config);
        record.state = SandboxState::Ready;
        record.metrics.startup_time = start.elapsed();
        tracing::info!(
            sandbox_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox ready"
        );

        Ok(Self {
            id,
            inner: Mutex::new(Inner {
                record,
                vm: Some(vm),
                executor,
            }),
        })
    }
}

#[async_trait]
impl Sandbox for MicroVmSandbox {
    fn id(&self) -> &SandboxId {
        &self.id
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let mut guard = self.inner.lock().await;
        let Inner { record, executor, .. } = &mut *guard;
        record.require(SandboxState::Ready, "execute")?;
        record.state = SandboxState::Running;

        let timeout = request.effective_timeout(record.config.exec_timeout);
        tracing::debug!(
            sandbox_id = %self.id,
            program = request.program().unwrap_or_default(),
            timeout_ms = timeout.as_millis() as u64,
            "Executing command"
        );
        let started = Instant::now();
        let result = executor.execute(&request, timeout).await;
        let elapsed = started.elapsed();

        record.state = SandboxState::Ready;
        record.touch();
        match &result {
            Ok(r) => {
                let usage = (!r.simulated).then_some(r.resource_usage);
                record.metrics.record_execution(elapsed, usage);
                tracing::debug!(
                    sandbox_id = %self.id,
                    exit_code = r.exit_code,
                    stdout_len = r.stdout.len(),
                    stderr_len = r.stderr.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Command completed"
                );
            }
            Err(e) => {
                record.metrics.record_execution(elapsed, None);
                record.metrics.error_count += 1;
                tracing::warn!(sandbox_id = %self.id, error = %e, "Command failed");
            }
        }
        result
    }

    async fn create_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Inner { record, vm, .. } = &mut *guard;
        record.require(SandboxState::Ready, "create_snapshot")?;
        record.require_new_snapshot(snapshot_id)?;
        let paths = snapshot_paths(record, snapshot_id)?;
        let Some(vm) = vm.as_mut() else {
            return Err(CoreError::NotFound(format!("VM for sandbox {}", self.id)));
        };

        let start = Instant::now();
        record.state = SandboxState::Snapshot;
        tracing::debug!(sandbox_id = %self.id, snapshot_id, "Creating snapshot");

        if let Err(e) = vm.snapshot(&paths).await {
            record.metrics.error_count += 1;
            // snapshot() resumes the VM even on failure; if that also failed
            // the guest is stuck paused.
            record.state = if vm.state() == VmState::Running {
                SandboxState::Ready
            } else {
                SandboxState::Error
            };
            discard_artifacts(&self.id, &paths).await;
            tracing::error!(sandbox_id = %self.id, snapshot_id, error = %e, "Snapshot failed");
            return Err(CoreError::Snapshot {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                message: e.to_string(),
            });
        }

        record.state = SandboxState::Ready;
        if let Err(e) = paths.verify().await {
            record.metrics.error_count += 1;
            discard_artifacts(&self.id, &paths).await;
            return Err(CoreError::SnapshotMissingArtifact {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                detail: e.to_string(),
            });
        }

        record.snapshots.push(snapshot_id.to_string());
        record.metrics.snapshot_time = start.elapsed();
        record.touch();
        tracing::info!(
            sandbox_id = %self.id,
            snapshot_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Snapshot created"
        );
        Ok(())
    }

    async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Inner { record, vm, executor } = &mut *guard;
        record.require_snapshot(snapshot_id)?;
        record.require(SandboxState::Ready, "restore_snapshot")?;
        let paths = snapshot_paths(record, snapshot_id)?;
        if let Err(e) = paths.verify().await {
            return Err(CoreError::SnapshotMissingArtifact {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                detail: e.to_string(),
            });
        }
        let Some(vm) = vm.as_mut() else {
            return Err(CoreError::NotFound(format!("VM for sandbox {}", self.id)));
        };

        let start = Instant::now();
        record.state = SandboxState::Snapshot;
        tracing::debug!(sandbox_id = %self.id, snapshot_id, "Restoring snapshot");

        // The old VM process is gone once restore starts, so any failure from
        // here on leaves nothing usable.
        if let Err(e) = vm.restore(&paths).await {
            record.fail();
            tracing::error!(sandbox_id = %self.id, snapshot_id, error = %e, "Restore failed");
            return Err(CoreError::Snapshot {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                message: e.to_string(),
            });
        }
        if let Err(e) = executor.reconnect().await {
            record.fail();
            tracing::error!(sandbox_id = %self.id, snapshot_id, error = %e, "Executor reconnect after restore failed");
            return Err(CoreError::lifecycle(self.id.as_str(), "restore", e));
        }

        record.state = SandboxState::Ready;
        record.metrics.restore_time = start.elapsed();
        record.touch();
        tracing::info!(
            sandbox_id = %self.id,
            snapshot_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Snapshot restored"
        );
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().await.record.snapshots.clone())
    }

    async fn info(&self) -> Result<SandboxInfo> {
        Ok(self.inner.lock().await.record.info())
    }

    async fn start(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Inner { record, vm, .. } = &mut *guard;
        record.require(SandboxState::Stopped, "start")?;
        let Some(vm) = vm.as_mut() else {
            return Err(CoreError::NotFound(format!("VM for sandbox {}", self.id)));
        };

        if let Err(e) = vm.resume().await {
            record.fail();
            return Err(CoreError::lifecycle(self.id.as_str(), "start", e.into()));
        }
        record.state = SandboxState::Ready;
        record.metrics.restart_count += 1;
        tracing::debug!(sandbox_id = %self.id, "Sandbox resumed");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Inner { record, vm, .. } = &mut *guard;
        match record.state {
            SandboxState::Stopped => return Ok(()),
            SandboxState::Ready | SandboxState::Running | SandboxState::Snapshot => {}
            _ => record.require(SandboxState::Ready, "stop")?,
        }
        let Some(vm) = vm.as_mut() else {
            return Err(CoreError::NotFound(format!("VM for sandbox {}", self.id)));
        };

        if let Err(e) = vm.pause().await {
            record.fail();
            return Err(CoreError::lifecycle(self.id.as_str(), "stop", e.into()));
        }
        record.state = SandboxState::Stopped;
        tracing::debug!(sandbox_id = %self.id, "Sandbox paused");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.record.state == SandboxState::Destroyed {
            return Ok(());
        }
        let start = Instant::now();
        tracing::info!(sandbox_id = %self.id, "Destroying sandbox");

        if let Some(mut vm) = guard.vm.take() {
            match vm.shutdown().await {
                Ok(()) => tokio::time::sleep(SHUTDOWN_GRACE).await,
                Err(e) => tracing::debug!(sandbox_id = %self.id, error = %e, "Graceful shutdown unavailable"),
            }
            if let Err(e) = vm.destroy().await {
                tracing::error!(sandbox_id = %self.id, error = %e, "Failed to stop VM");
            }
        }

        let config = &guard.record.config;
        remove_dir(&self.id, &config.chroot_path.join(self.id.as_str())).await;
        if let Err(e) = tokio::fs::remove_file(&config.socket_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to remove vsock socket");
            }
        }
        remove_dir(&self.id, &instance_dir(&config.snapshot_dir, self.id.as_str())).await;

        guard.record.state = SandboxState::Destroyed;
        tracing::info!(
            sandbox_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox destroyed"
        );
        Ok(())
    }
}

fn snapshot_paths(record: &SandboxRecord, snapshot_id: &str) -> Result<SnapshotPaths> {
    SnapshotPaths::new(&record.config.snapshot_dir, record.id.as_str(), snapshot_id).map_err(|e| {
        CoreError::Snapshot {
            sandbox_id: record.id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            message: e.to_string(),
        }
    })
}

async fn discard_artifacts(id: &SandboxId, paths: &SnapshotPaths) {
    if let Err(e) = paths.remove().await {
        tracing::warn!(sandbox_id = %id, error = %e, "Failed to remove partial snapshot artifacts");
    }
}

async fn remove_dir(id: &SandboxId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(sandbox_id = %id, path = %dir.display(), "Removed directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(sandbox_id = %id, path = %dir.display(), error = %e, "Failed to remove directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_create_requires_boot_artifacts() {
        let config = SandboxConfig::builder().vsock_cid(3).build_partial();
        let err = MicroVmSandbox::create(config).await.err().unwrap();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_create_requires_cid() {
        let config = SandboxConfig::builder()
            .kernel("/path/to/vmlinux")
            .rootfs("/path/to/rootfs.ext4")
            .build_partial();
        let err = MicroVmSandbox::create(config).await.err().unwrap();
        assert!(err.to_string().contains("vsock_cid"));
    }

    #[test]
    fn test_snapshot_paths_use_sandbox_dir() {
        let config = SandboxConfig::builder()
            .vm_id("sb-1")
            .snapshot_dir("/var/lib/grove/snapshots")
            .build()
            .unwrap();
        let record = SandboxRecord::new(SandboxId::from("sb-1"), config);
        let paths = snapshot_paths(&record, "node-3").unwrap();
        assert_eq!(paths.state, PathBuf::from("/var/lib/grove/snapshots/sb-1/node-3.vmstate"));
        assert_eq!(paths.memory, PathBuf::from("/var/lib/grove/snapshots/sb-1/node-3.mem"));

        assert!(matches!(
            snapshot_paths(&record, "../escape"),
            Err(CoreError::Snapshot { .. })
        ));
    }
}
