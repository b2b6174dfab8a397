//! Configuration for the grove daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use grove_core::{ExecutionStrategy, PoolConfig, SandboxConfig, StateStoreConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the grove daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the kernel image.
    pub kernel_path: PathBuf,

    /// Path to the rootfs image.
    pub rootfs_path: PathBuf,

    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,

    /// Working directory for VM sockets.
    pub chroot_path: PathBuf,

    /// Root directory for snapshot artifacts.
    pub snapshot_dir: PathBuf,

    /// Pool capacity (default: 4).
    pub pool_size: usize,

    /// Guest memory per sandbox in MiB (default: 512).
    pub memory_mb: u32,

    /// vCPUs per sandbox (default: 1).
    pub vcpu_count: u8,

    /// How commands reach the guest (default: agent).
    pub execution: ExecutionStrategy,

    /// Interval between health sweeps (default: 30s).
    pub health_interval: Duration,

    /// Interval between stats log lines (default: 60s).
    pub stats_interval: Duration,

    /// State-store binary. The state store is disabled when unset.
    pub state_store_binary: Option<PathBuf>,

    /// State-store working directory.
    pub state_store_work_dir: PathBuf,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("kernel file not found: {0}")]
    MissingKernel(PathBuf),

    #[error("rootfs file not found: {0}")]
    MissingRootfs(PathBuf),

    #[error("firecracker binary not found: {0}")]
    MissingFirecracker(PathBuf),

    #[error("state store binary not found: {0}")]
    MissingStateStore(PathBuf),

    #[error("pool size must be at least 1")]
    EmptyPool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/grove/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/grove/rootfs.ext4"),
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            chroot_path: PathBuf::from("/tmp/grove"),
            snapshot_dir: PathBuf::from("/var/lib/grove/snapshots"),
            pool_size: 4,
            memory_mb: 512,
            vcpu_count: 1,
            execution: ExecutionStrategy::Agent,
            health_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            state_store_binary: None,
            state_store_work_dir: PathBuf::from("/var/lib/grove/state"),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `GROVE_KERNEL` | `/var/lib/grove/vmlinux` |
    /// | `GROVE_ROOTFS` | `/var/lib/grove/rootfs.ext4` |
    /// | `GROVE_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `GROVE_CHROOT` | `/tmp/grove` |
    /// | `GROVE_SNAPSHOT_DIR` | `/var/lib/grove/snapshots` |
    /// | `GROVE_POOL_SIZE` | `4` |
    /// | `GROVE_MEMORY_MB` | `512` |
    /// | `GROVE_VCPUS` | `1` |
    /// | `GROVE_EXEC_STRATEGY` | `agent` (agent, simulated) |
    /// | `GROVE_HEALTH_INTERVAL_SECS` | `30` |
    /// | `GROVE_STATS_INTERVAL_SECS` | `60` |
    /// | `GROVE_HELIOS_BIN` | unset (state store disabled) |
    /// | `GROVE_HELIOS_WORK` | `/var/lib/grove/state` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let path = |key: &str, fallback: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(fallback);
        let secs = |key: &str, fallback: Duration| {
            parsed::<u64>(&lookup, key)
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            kernel_path: path("GROVE_KERNEL", default.kernel_path),
            rootfs_path: path("GROVE_ROOTFS", default.rootfs_path),
            firecracker_path: path("GROVE_FIRECRACKER", default.firecracker_path),
            chroot_path: path("GROVE_CHROOT", default.chroot_path),
            snapshot_dir: path("GROVE_SNAPSHOT_DIR", default.snapshot_dir),
            pool_size: parsed(&lookup, "GROVE_POOL_SIZE").unwrap_or(default.pool_size),
            memory_mb: parsed(&lookup, "GROVE_MEMORY_MB").unwrap_or(default.memory_mb),
            vcpu_count: parsed(&lookup, "GROVE_VCPUS").unwrap_or(default.vcpu_count),
            execution: lookup("GROVE_EXEC_STRATEGY")
                .map(|v| parse_strategy(&v))
                .unwrap_or(default.execution),
            health_interval: secs("GROVE_HEALTH_INTERVAL_SECS", default.health_interval),
            stats_interval: secs("GROVE_STATS_INTERVAL_SECS", default.stats_interval),
            state_store_binary: lookup("GROVE_HELIOS_BIN")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            state_store_work_dir: path("GROVE_HELIOS_WORK", default.state_store_work_dir),
        }
    }

    /// Template every pooled sandbox is built from.
    pub fn template(&self) -> SandboxConfig {
        SandboxConfig::builder()
            .kernel(&self.kernel_path)
            .rootfs(&self.rootfs_path)
            .firecracker_path(&self.firecracker_path)
            .chroot_path(&self.chroot_path)
            .snapshot_dir(&self.snapshot_dir)
            .memory_mb(self.memory_mb)
            .vcpu_count(self.vcpu_count)
            .execution(self.execution)
            .build_partial()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.pool_size, self.template())
    }

    /// State-store settings, if a binary is configured.
    pub fn state_store(&self) -> Option<StateStoreConfig> {
        self.state_store_binary
            .as_ref()
            .map(|bin| StateStoreConfig::new(bin, &self.state_store_work_dir))
    }

    /// Validate that all configured paths exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if !self.kernel_path.exists() {
            return Err(ConfigError::MissingKernel(self.kernel_path.clone()));
        }
        if !self.rootfs_path.exists() {
            return Err(ConfigError::MissingRootfs(self.rootfs_path.clone()));
        }
        if !self.firecracker_path.exists() {
            return Err(ConfigError::MissingFirecracker(self.firecracker_path.clone()));
        }
        if let Some(bin) = &self.state_store_binary {
            if !bin.exists() {
                return Err(ConfigError::MissingStateStore(bin.clone()));
            }
        }
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if !self.kernel_path.exists() {
            tracing::warn!("Kernel not found: {:?}", self.kernel_path);
        }
        if !self.rootfs_path.exists() {
            tracing::warn!("Rootfs not found: {:?}", self.rootfs_path);
        }
        if !self.firecracker_path.exists() {
            tracing::warn!("Firecracker not found: {:?}", self.firecracker_path);
        }
        if let Some(bin) = &self.state_store_binary {
            if !bin.exists() {
                tracing::warn!("State store binary not found: {:?}", bin);
            }
        }
        if self.execution == ExecutionStrategy::Simulated {
            tracing::warn!("Simulated execution enabled, command results are fabricated");
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

fn parse_strategy(s: &str) -> ExecutionStrategy {
    match s.to_lowercase().as_str() {
        "simulated" | "sim" => ExecutionStrategy::Simulated,
        "agent" => ExecutionStrategy::Agent,
        other => {
            tracing::warn!(value = other, "Unknown execution strategy, using agent");
            ExecutionStrategy::Agent
        }
    }
}
