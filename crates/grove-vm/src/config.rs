//! Machine shape and on-host file layout of one microVM.
//!
//! Everything a VM owns on the host lives in its working directory:
//!
//! ```text
//! <chroot_path>/<vm_id>/firecracker.socket   API socket
//! <chroot_path>/<vm_id>/v.sock               vsock UDS (unless overridden)
//! ```

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the Firecracker API socket inside a VM's working directory.
pub const API_SOCKET_NAME: &str = "firecracker.socket";

/// File name of the vsock UDS inside a VM's working directory.
pub const VSOCK_SOCKET_NAME: &str = "v.sock";

/// Serial console, reboot-as-exit, no PCI.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Firecracker's vCPU ceiling.
pub const MAX_VCPUS: u8 = 32;

/// Smallest guest that boots the grove rootfs.
pub const MIN_MEMORY_MIB: u32 = 128;

/// Everything needed to boot one microVM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub memory_mib: u32,
    pub kernel_path: PathBuf,
    pub boot_args: String,
    /// Root block device, attached as `rootfs`.
    pub rootfs_path: PathBuf,
    pub rootfs_read_only: bool,
    pub network: Option<NetworkConfig>,
    pub vsock: Option<VsockConfig>,
    pub firecracker_path: PathBuf,
    /// Parent of every VM working directory.
    pub chroot_path: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            memory_mib: 512,
            kernel_path: PathBuf::from("/var/lib/grove/vmlinux"),
            boot_args: DEFAULT_BOOT_ARGS.into(),
            rootfs_path: PathBuf::from("/var/lib/grove/rootfs.ext4"),
            rootfs_read_only: false,
            network: None,
            vsock: None,
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            chroot_path: PathBuf::from("/tmp/grove"),
        }
    }
}

impl MachineConfig {
    /// Check limits Firecracker would otherwise reject mid-boot.
    pub fn validate(&self) -> Result<()> {
        if self.vcpu_count == 0 || self.vcpu_count > MAX_VCPUS {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-{MAX_VCPUS}, got {}",
                self.vcpu_count
            )));
        }
        if self.memory_mib < MIN_MEMORY_MIB {
            return Err(VmError::Config(format!(
                "memory_mib must be at least {MIN_MEMORY_MIB}, got {}",
                self.memory_mib
            )));
        }
        if self.kernel_path.as_os_str().is_empty() {
            return Err(VmError::Config("kernel_path is empty".into()));
        }
        if self.rootfs_path.as_os_str().is_empty() {
            return Err(VmError::Config("rootfs_path is empty".into()));
        }
        // CIDs 0, 1 and 2 are reserved
        if let Some(vsock) = &self.vsock {
            if vsock.guest_cid <= 2 {
                return Err(VmError::Config(format!(
                    "vsock guest_cid must be > 2, got {}",
                    vsock.guest_cid
                )));
            }
        }
        if let Some(net) = &self.network {
            if net.host_dev_name.is_empty() {
                return Err(VmError::Config("network host_dev_name is empty".into()));
            }
        }
        Ok(())
    }

    /// Per-VM working directory.
    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.chroot_path.join(vm_id)
    }

    /// Path of the Firecracker API socket for a VM.
    pub fn api_socket_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join(API_SOCKET_NAME)
    }
}

/// TAP-backed guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub iface_id: String,
    /// Host TAP device.
    pub host_dev_name: String,
    /// Assigned by Firecracker when `None`.
    pub guest_mac: Option<String>,
}

impl NetworkConfig {
    /// `eth0` on the given TAP device.
    pub fn tap(host_dev: impl Into<String>) -> Self {
        Self {
            iface_id: "eth0".into(),
            host_dev_name: host_dev.into(),
            guest_mac: None,
        }
    }
}

/// vsock device for guest-host communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest CID, must be > 2
    pub guest_cid: u32,
    /// Host-side UDS Firecracker multiplexes guest ports over
    pub uds_path: PathBuf,
}

impl VsockConfig {
    /// vsock config with the UDS in the VM's working directory.
    pub fn for_vm(cid: u32, chroot_path: &Path, vm_id: &str) -> Self {
        Self {
            guest_cid: cid,
            uds_path: chroot_path.join(vm_id).join(VSOCK_SOCKET_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_limits() {
        let mut config = MachineConfig::default();
        assert!(config.validate().is_ok());

        config.vcpu_count = 0;
        assert!(config.validate().is_err());
        config.vcpu_count = MAX_VCPUS + 1;
        assert!(config.validate().is_err());
        config.vcpu_count = 4;

        config.memory_mib = 64;
        assert!(config.validate().is_err());
        config.memory_mib = MIN_MEMORY_MIB;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_boot_images() {
        let config = MachineConfig {
            kernel_path: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("kernel_path"));

        let config = MachineConfig {
            rootfs_path: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("rootfs_path"));
    }

    #[test]
    fn test_validate_devices() {
        let mut config = MachineConfig {
            vsock: Some(VsockConfig::for_vm(2, Path::new("/tmp/grove"), "vm-1")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.vsock = Some(VsockConfig::for_vm(3, Path::new("/tmp/grove"), "vm-1"));
        assert!(config.validate().is_ok());

        config.network = Some(NetworkConfig::tap(""));
        assert!(config.validate().is_err());
        config.network = Some(NetworkConfig::tap("tap0"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_vm_layout() {
        let config = MachineConfig {
            chroot_path: PathBuf::from("/tmp/grove"),
            ..Default::default()
        };
        assert_eq!(config.vm_dir("vm-1"), PathBuf::from("/tmp/grove/vm-1"));
        assert_eq!(
            config.api_socket_path("vm-1"),
            PathBuf::from("/tmp/grove/vm-1/firecracker.socket")
        );
        assert_eq!(
            VsockConfig::for_vm(5, &config.chroot_path, "vm-1").uds_path,
            PathBuf::from("/tmp/grove/vm-1/v.sock")
        );
    }
}
