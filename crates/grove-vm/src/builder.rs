//! Fluent construction of a [`VirtualMachine`].

use crate::config::{MachineConfig, NetworkConfig, VsockConfig};
use crate::error::Result;
use crate::VirtualMachine;
use std::path::PathBuf;
use uuid::Uuid;

/// Builder for booting a microVM.
///
/// Paths that depend on the VM ID (the vsock UDS when only a CID is given)
/// are resolved when the ID is known, in [`config_for`](Self::config_for).
///
/// ```no_run
/// use grove_vm::VmBuilder;
///
/// # async fn example() -> grove_vm::Result<()> {
/// let vm = VmBuilder::new()
///     .vcpus(2)
///     .memory_mib(512)
///     .kernel("/path/to/vmlinux")
///     .rootfs("/path/to/rootfs.ext4")
///     .with_vsock(3)
///     .build_with_id("sandbox-1")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VmBuilder {
    config: MachineConfig,
    vsock_cid: Option<u32>,
}

impl VmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.rootfs_path = path.into();
        self
    }

    /// Attach a TAP device as `eth0`.
    pub fn with_network(mut self, host_dev: &str) -> Self {
        self.config.network = Some(NetworkConfig::tap(host_dev));
        self
    }

    /// Attach vsock with the UDS in the VM's working directory.
    pub fn with_vsock(mut self, cid: u32) -> Self {
        self.vsock_cid = Some(cid);
        self.config.vsock = None;
        self
    }

    /// Attach vsock with an explicit UDS path. An empty path falls back to
    /// the working directory, as with [`with_vsock`](Self::with_vsock).
    pub fn with_vsock_config(mut self, config: VsockConfig) -> Self {
        if config.uds_path.as_os_str().is_empty() {
            return self.with_vsock(config.guest_cid);
        }
        self.vsock_cid = None;
        self.config.vsock = Some(config);
        self
    }

    pub fn firecracker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_path = path.into();
        self
    }

    /// Parent directory of the VM's working directory.
    pub fn chroot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.chroot_path = path.into();
        self
    }

    /// The machine config a VM named `vm_id` would boot with.
    pub fn config_for(&self, vm_id: &str) -> MachineConfig {
        let mut config = self.config.clone();
        if let Some(cid) = self.vsock_cid {
            config.vsock = Some(VsockConfig::for_vm(cid, &config.chroot_path, vm_id));
        }
        config
    }

    /// Boot under a random ID.
    pub async fn build(self) -> Result<VirtualMachine> {
        self.build_with_id(Uuid::new_v4().to_string()).await
    }

    /// Boot under `id`, which names the VM's working directory and sockets.
    pub async fn build_with_id(self, id: impl Into<String>) -> Result<VirtualMachine> {
        let id = id.into();
        let config = self.config_for(&id);
        VirtualMachine::create_with_id(id, config).await
    }
}
