//! VirtualMachine type - main interface for managing MicroVMs.

use crate::api::{FirecrackerApi, API_READY_TIMEOUT};
use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use crate::snapshot::SnapshotPaths;
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::{Child, Command};

/// Drive ID of the root block device.
const ROOTFS_DRIVE_ID: &str = "rootfs";

/// Represents a running, paused or stopped MicroVM instance.
pub struct VirtualMachine {
    /// Unique identifier for this VM
    id: String,
    /// Configuration used to create this VM
    config: MachineConfig,
    /// Current state of the VM
    state: VmState,
    /// Process backing the VM
    process: VmProcess,
    /// Client for the Firecracker API socket
    api: FirecrackerApi,
}

/// The Firecracker process behind a VM.
///
/// A VM booted from scratch is owned by firepilot. A VM restored from a
/// snapshot runs in a process spawned directly, since firepilot cannot load
/// snapshots into an unconfigured instance.
enum VmProcess {
    Firepilot(Machine),
    Spawned(Child),
    Exited,
}

/// Current state of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// VM is being created
    Creating,
    /// VM is running
    Running,
    /// VM is paused
    Paused,
    /// VM is stopped
    Stopped,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Creating => write!(f, "creating"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

impl VirtualMachine {
    /// Boot a microVM named `id`.
    ///
    /// firepilot spawns Firecracker and applies kernel, drive and network
    /// config. Sizing and vsock go through the API socket afterwards, since
    /// both must land before `InstanceStart`.
    pub async fn create_with_id(id: impl Into<String>, config: MachineConfig) -> Result<Self> {
        config.validate()?;

        let id = id.into();
        let start = Instant::now();
        tracing::info!(vm_id = %id, vcpus = config.vcpu_count, memory_mib = config.memory_mib, "Booting microVM");

        let mut machine = Machine::new();
        machine
            .create(firepilot_config(&id, &config)?)
            .await
            .map_err(|e| VmError::Boot {
                vm_id: id.clone(),
                stage: "create",
                message: format!("{e:?}"),
            })?;

        let api = FirecrackerApi::new(config.api_socket_path(&id));
        api.configure_machine(config.vcpu_count, config.memory_mib).await?;
        if let Some(vsock) = &config.vsock {
            api.configure_vsock(vsock).await?;
        }

        machine.start().await.map_err(|e| VmError::Boot {
            vm_id: id.clone(),
            stage: "start",
            message: format!("{e:?}"),
        })?;

        tracing::info!(
            vm_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MicroVM running"
        );

        Ok(Self {
            id,
            config,
            state: VmState::Running,
            process: VmProcess::Firepilot(machine),
            api,
        })
    }

    /// Get the unique ID of this VM.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the current state of the VM.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Get the configuration used to create this VM.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Get the path to the Firecracker API socket.
    pub fn socket_path(&self) -> &Path {
        self.api.socket_path()
    }

    /// Get the vsock UDS path if vsock is configured.
    ///
    /// This path is used by the host to communicate with the guest agent.
    pub fn vsock_uds_path(&self) -> Option<&PathBuf> {
        self.config.vsock.as_ref().map(|v| &v.uds_path)
    }

    /// Pause all vCPUs. Guest memory stays resident.
    pub async fn pause(&mut self) -> Result<()> {
        self.expect_state(VmState::Running, "pause")?;
        tracing::debug!(vm_id = %self.id, "Pausing VM");
        self.api.pause().await?;
        self.state = VmState::Paused;
        Ok(())
    }

    /// Resume a paused VM.
    pub async fn resume(&mut self) -> Result<()> {
        self.expect_state(VmState::Paused, "resume")?;
        tracing::debug!(vm_id = %self.id, "Resuming VM");
        self.api.resume().await?;
        self.state = VmState::Running;
        Ok(())
    }

    /// Write a full snapshot of the VM to `paths`.
    ///
    /// A running VM is paused for the duration of the write and resumed
    /// afterwards, even if the write fails.
    pub async fn snapshot(&mut self, paths: &SnapshotPaths) -> Result<()> {
        let was_running = match self.state {
            VmState::Running => true,
            VmState::Paused => false,
            _ => return Err(self.invalid_state("snapshot")),
        };

        let start = Instant::now();
        paths.prepare().await?;
        if was_running {
            self.pause().await?;
        }

        let written = self.api.create_snapshot(&paths.state, &paths.memory).await;

        if was_running {
            if let Err(e) = self.resume().await {
                tracing::error!(vm_id = %self.id, error = %e, "Failed to resume VM after snapshot");
                return Err(written.err().unwrap_or(e));
            }
        }
        written?;

        tracing::info!(
            vm_id = %self.id,
            state_file = %paths.state.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM snapshot written"
        );
        Ok(())
    }

    /// Replace the running VM with the one captured in `paths`.
    ///
    /// The current Firecracker process is killed, a fresh one is spawned on
    /// the same API socket, and the snapshot is loaded and resumed.
    pub async fn restore(&mut self, paths: &SnapshotPaths) -> Result<()> {
        let start = Instant::now();
        paths.verify().await?;

        tracing::info!(vm_id = %self.id, state_file = %paths.state.display(), "Restoring VM from snapshot");
        self.terminate().await?;

        // Firecracker refuses to bind over stale sockets
        remove_if_exists(self.api.socket_path()).await?;
        if let Some(uds) = self.vsock_uds_path().cloned() {
            remove_if_exists(&uds).await?;
        }

        let child = Command::new(&self.config.firecracker_path)
            .arg("--api-sock")
            .arg(self.api.socket_path())
            .current_dir(self.config.vm_dir(&self.id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmError::Process {
                vm_id: self.id.clone(),
                action: "spawn",
                message: e.to_string(),
            })?;
        self.process = VmProcess::Spawned(child);

        self.api.wait_ready(API_READY_TIMEOUT).await?;
        self.api
            .load_snapshot(&paths.state, &paths.memory, true)
            .await?;
        self.state = VmState::Running;

        tracing::info!(
            vm_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM restored from snapshot"
        );
        Ok(())
    }

    /// Ask the guest to shut down gracefully.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !matches!(self.state, VmState::Running | VmState::Paused) {
            return Err(self.invalid_state("shut down"));
        }
        tracing::info!(vm_id = %self.id, "Requesting guest shutdown");
        self.api.send_ctrl_alt_del().await.map_err(|e| VmError::Process {
            vm_id: self.id.clone(),
            action: "shutdown",
            message: e.to_string(),
        })?;
        self.state = VmState::Stopped;
        Ok(())
    }

    /// Force kill the VM.
    ///
    /// This immediately terminates the VM without graceful shutdown.
    pub async fn kill(&mut self) -> Result<()> {
        tracing::warn!(vm_id = %self.id, "Force killing VM");
        self.terminate().await?;
        self.state = VmState::Stopped;
        Ok(())
    }

    /// Destroy the VM and cleanup resources.
    ///
    /// This consumes the VirtualMachine, killing the process if still alive.
    pub async fn destroy(mut self) -> Result<()> {
        tracing::info!(vm_id = %self.id, "Destroying VM");
        if !matches!(self.process, VmProcess::Exited) {
            if let Err(e) = self.terminate().await {
                tracing::warn!(vm_id = %self.id, error = %e, "Kill during destroy failed");
            }
        }
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        let killed = match std::mem::replace(&mut self.process, VmProcess::Exited) {
            VmProcess::Firepilot(mut machine) => machine.kill().await.map_err(|e| format!("{e:?}")),
            VmProcess::Spawned(mut child) => child.kill().await.map_err(|e| e.to_string()),
            VmProcess::Exited => Ok(()),
        };
        killed.map_err(|message| VmError::Process {
            vm_id: self.id.clone(),
            action: "kill",
            message,
        })
    }

    fn expect_state(&self, expected: VmState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str) -> VmError {
        VmError::InvalidState {
            vm_id: self.id.clone(),
            operation,
            state: self.state,
        }
    }
}

/// Translate a machine config into firepilot's boot configuration.
fn firepilot_config(id: &str, config: &MachineConfig) -> Result<Configuration> {
    let rejected = |what: &str, e: &dyn std::fmt::Debug| VmError::Config(format!("{what}: {e:?}"));

    let kernel = KernelBuilder::new()
        .with_kernel_image_path(config.kernel_path.to_string_lossy().to_string())
        .with_boot_args(config.boot_args.clone())
        .try_build()
        .map_err(|e| rejected("kernel", &e))?;

    let mut rootfs = DriveBuilder::new()
        .with_drive_id(ROOTFS_DRIVE_ID.to_string())
        .with_path_on_host(config.rootfs_path.clone())
        .as_root_device();
    if config.rootfs_read_only {
        rootfs = rootfs.as_read_only();
    }
    let rootfs = rootfs.try_build().map_err(|e| rejected("rootfs", &e))?;

    let executor = FirecrackerExecutorBuilder::new()
        .with_chroot(config.chroot_path.to_string_lossy().to_string())
        .with_exec_binary(config.firecracker_path.clone())
        .try_build()
        .map_err(|e| rejected("executor", &e))?;

    let mut boot = Configuration::new(id.to_string())
        .with_kernel(kernel)
        .with_executor(executor)
        .with_drive(rootfs);

    if let Some(net) = &config.network {
        let mut iface = NetworkInterfaceBuilder::new()
            .with_iface_id(net.iface_id.clone())
            .with_host_dev_name(net.host_dev_name.clone());
        if let Some(mac) = &net.guest_mac {
            iface = iface.with_guest_mac(mac.clone());
        }
        boot = boot.with_interface(iface.try_build().map_err(|e| rejected("network", &e))?);
    }
    Ok(boot)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_state_display() {
        assert_eq!(VmState::Creating.to_string(), "creating");
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Paused.to_string(), "paused");
        assert_eq!(VmState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.socket");
        remove_if_exists(&path).await.unwrap();
        tokio::fs::write(&path, b"").await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }
}
