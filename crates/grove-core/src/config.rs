//! Sandbox configuration types.
//!
//! A `SandboxConfig` doubles as a partial override: zero or empty fields mean
//! "not set". A pool's template is merged with a caller's override field by
//! field, then [`SandboxConfig::resolved`] fills whatever is still unset.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Default guest memory in MiB.
pub const DEFAULT_MEMORY_MB: u32 = 256;
/// Default vCPU count.
pub const DEFAULT_VCPU_COUNT: u8 = 2;
/// Default scratch disk budget in MiB.
pub const DEFAULT_DISK_MB: u32 = 1024;
/// Default per-command execution timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Guest networking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network device.
    Isolated,
    /// Attach a TAP device on the host.
    Tap {
        /// Host TAP device name.
        host_dev: String,
    },
}

/// How commands reach the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// JSON-RPC to grove-agent over vsock.
    #[default]
    Agent,
    /// Placeholder that fabricates plausible output. Results are flagged
    /// `simulated` and must not be used as performance data.
    Simulated,
}

/// Configuration for creating a sandbox.
///
/// `Default` is the empty config, i.e. "no overrides".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Instance identifier. Generated as a UUID when empty.
    pub vm_id: String,
    /// Guest memory in MiB.
    pub memory_mb: u32,
    /// vCPU count.
    pub vcpu_count: u8,
    /// Scratch disk budget in MiB.
    pub disk_mb: u32,
    /// Per-command execution timeout.
    pub exec_timeout: Duration,
    /// Guest networking.
    pub network: Option<NetworkMode>,
    /// Path to kernel image.
    pub kernel_path: PathBuf,
    /// Path to rootfs image.
    pub rootfs_path: PathBuf,
    /// Host-side vsock socket. Derived from `chroot_path` when empty.
    pub socket_path: PathBuf,
    /// Working directory for VM sockets and state.
    pub chroot_path: PathBuf,
    /// Root directory for snapshot artifacts.
    pub snapshot_dir: PathBuf,
    /// Path to Firecracker binary.
    pub firecracker_path: PathBuf,
    /// Guest CID for vsock (0 = assigned by the factory, otherwise >= 3).
    pub vsock_cid: u32,
    /// How commands reach the guest.
    pub execution: Option<ExecutionStrategy>,
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Merge `overrides` on top of `self`.
    ///
    /// Each override field wins when it is non-zero / non-empty. The
    /// template's `vm_id` is never inherited: every instance gets its own.
    pub fn merged_with(&self, overrides: &SandboxConfig) -> SandboxConfig {
        fn pick<T: Clone + PartialEq + Default>(base: &T, over: &T) -> T {
            if *over != T::default() {
                over.clone()
            } else {
                base.clone()
            }
        }

        SandboxConfig {
            vm_id: overrides.vm_id.clone(),
            memory_mb: pick(&self.memory_mb, &overrides.memory_mb),
            vcpu_count: pick(&self.vcpu_count, &overrides.vcpu_count),
            disk_mb: pick(&self.disk_mb, &overrides.disk_mb),
            exec_timeout: pick(&self.exec_timeout, &overrides.exec_timeout),
            network: pick(&self.network, &overrides.network),
            kernel_path: pick(&self.kernel_path, &overrides.kernel_path),
            rootfs_path: pick(&self.rootfs_path, &overrides.rootfs_path),
            socket_path: pick(&self.socket_path, &overrides.socket_path),
            chroot_path: pick(&self.chroot_path, &overrides.chroot_path),
            snapshot_dir: pick(&self.snapshot_dir, &overrides.snapshot_dir),
            firecracker_path: pick(&self.firecracker_path, &overrides.firecracker_path),
            vsock_cid: pick(&self.vsock_cid, &overrides.vsock_cid),
            execution: pick(&self.execution, &overrides.execution),
        }
    }

    /// Fill every unset field with its default and generate a `vm_id`.
    pub fn resolved(mut self) -> SandboxConfig {
        if self.vm_id.is_empty() {
            self.vm_id = Uuid::new_v4().to_string();
        }
        if self.memory_mb == 0 {
            self.memory_mb = DEFAULT_MEMORY_MB;
        }
        if self.vcpu_count == 0 {
            self.vcpu_count = DEFAULT_VCPU_COUNT;
        }
        if self.disk_mb == 0 {
            self.disk_mb = DEFAULT_DISK_MB;
        }
        if self.exec_timeout.is_zero() {
            self.exec_timeout = DEFAULT_EXEC_TIMEOUT;
        }
        if self.network.is_none() {
            self.network = Some(NetworkMode::Isolated);
        }
        if self.chroot_path.as_os_str().is_empty() {
            self.chroot_path = PathBuf::from("/tmp/grove");
        }
        if self.snapshot_dir.as_os_str().is_empty() {
            self.snapshot_dir = self.chroot_path.join("snapshots");
        }
        if self.firecracker_path.as_os_str().is_empty() {
            self.firecracker_path = PathBuf::from("/usr/local/bin/firecracker");
        }
        if self.socket_path.as_os_str().is_empty() {
            self.socket_path = self.chroot_path.join(&self.vm_id).join("v.sock");
        }
        if self.execution.is_none() {
            self.execution = Some(ExecutionStrategy::default());
        }
        self
    }

    /// Execution strategy, defaulting to the agent.
    pub fn execution_strategy(&self) -> ExecutionStrategy {
        self.execution.unwrap_or_default()
    }

    /// Validate a resolved configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.vm_id.is_empty() {
            return Err(CoreError::Config("vm_id is required".into()));
        }
        if self.vm_id.contains('/') || self.vm_id.contains("..") {
            return Err(CoreError::Config(format!("invalid vm_id: {:?}", self.vm_id)));
        }
        if self.memory_mb == 0 {
            return Err(CoreError::Config("memory_mb must be > 0".into()));
        }
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(CoreError::Config(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }
        if self.exec_timeout.is_zero() {
            return Err(CoreError::Config("exec_timeout must be > 0".into()));
        }
        if self.vsock_cid != 0 && self.vsock_cid < 3 {
            return Err(CoreError::Config("vsock_cid must be >= 3".into()));
        }
        Ok(())
    }

    /// Check that the VM boot artifacts are configured.
    pub fn validate_boot_artifacts(&self) -> Result<(), CoreError> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(CoreError::Config("kernel_path is required".into()));
        }
        if self.rootfs_path.as_os_str().is_empty() {
            return Err(CoreError::Config("rootfs_path is required".into()));
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the instance ID.
    pub fn vm_id(mut self, id: impl Into<String>) -> Self {
        self.config.vm_id = id.into();
        self
    }

    /// Set the kernel path.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the rootfs path.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.rootfs_path = path.into();
        self
    }

    /// Set memory in MiB.
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.config.memory_mb = mb;
        self
    }

    /// Set vCPU count.
    pub fn vcpu_count(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set scratch disk budget in MiB.
    pub fn disk_mb(mut self, mb: u32) -> Self {
        self.config.disk_mb = mb;
        self
    }

    /// Set per-command execution timeout.
    pub fn exec_timeout(mut self, timeout: Duration) -> Self {
        self.config.exec_timeout = timeout;
        self
    }

    /// Set guest networking.
    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.config.network = Some(mode);
        self
    }

    /// Set the host-side vsock socket path.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Set the chroot/working directory path.
    pub fn chroot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.chroot_path = path.into();
        self
    }

    /// Set the snapshot artifact root.
    pub fn snapshot_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_dir = path.into();
        self
    }

    /// Set the Firecracker binary path.
    pub fn firecracker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_path = path.into();
        self
    }

    /// Set vsock guest CID (must be >= 3).
    pub fn vsock_cid(mut self, cid: u32) -> Self {
        self.config.vsock_cid = cid;
        self
    }

    /// Set the execution strategy.
    pub fn execution(mut self, strategy: ExecutionStrategy) -> Self {
        self.config.execution = Some(strategy);
        self
    }

    /// Return the config as-is, for use as a template or override.
    pub fn build_partial(self) -> SandboxConfig {
        self.config
    }

    /// Resolve defaults and validate.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        let config = self.config.resolved();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty_override() {
        let config = SandboxConfig::default();
        assert!(config.vm_id.is_empty());
        assert_eq!(config.memory_mb, 0);
        assert!(config.network.is_none());
    }

    #[test]
    fn test_resolved_fills_defaults() {
        let config = SandboxConfig::default().resolved();
        assert_eq!(config.vm_id.len(), 36);
        assert_eq!(config.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(config.vcpu_count, DEFAULT_VCPU_COUNT);
        assert_eq!(config.exec_timeout, DEFAULT_EXEC_TIMEOUT);
        assert_eq!(config.network, Some(NetworkMode::Isolated));
        assert_eq!(
            config.socket_path,
            PathBuf::from(format!("/tmp/grove/{}/v.sock", config.vm_id))
        );
        assert_eq!(config.snapshot_dir, PathBuf::from("/tmp/grove/snapshots"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_override_wins_when_set() {
        let template = SandboxConfig::builder()
            .vm_id("template-id")
            .kernel("/k/vmlinux")
            .rootfs("/r/rootfs.ext4")
            .memory_mb(512)
            .vcpu_count(2)
            .build_partial();
        let overrides = SandboxConfig::builder()
            .memory_mb(1024)
            .execution(ExecutionStrategy::Simulated)
            .build_partial();

        let merged = template.merged_with(&overrides);
        assert_eq!(merged.memory_mb, 1024);
        assert_eq!(merged.vcpu_count, 2);
        assert_eq!(merged.kernel_path, PathBuf::from("/k/vmlinux"));
        assert_eq!(merged.execution_strategy(), ExecutionStrategy::Simulated);
        // Template IDs never leak into instances
        assert!(merged.vm_id.is_empty());
    }

    #[test]
    fn test_merge_override_vm_id() {
        let template = SandboxConfig::default();
        let overrides = SandboxConfig::builder().vm_id("node-42").build_partial();
        let merged = template.merged_with(&overrides).resolved();
        assert_eq!(merged.vm_id, "node-42");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SandboxConfig::default().resolved();
        config.vcpu_count = 33;
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default().resolved();
        config.vsock_cid = 2;
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default().resolved();
        config.vm_id = "../escape".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_boot_artifacts_required() {
        let config = SandboxConfig::default().resolved();
        assert!(config.validate_boot_artifacts().is_err());

        let config = SandboxConfig::builder()
            .kernel("/path/to/vmlinux")
            .rootfs("/path/to/rootfs.ext4")
            .build()
            .expect("should build successfully");
        assert!(config.validate_boot_artifacts().is_ok());
    }
}
