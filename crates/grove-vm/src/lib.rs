//! # grove-vm
//!
//! MicroVM management layer for grove sandboxes.
//! Provides a high-level abstraction over firepilot/Firecracker, plus the
//! pause/resume and snapshot/restore operations firepilot does not expose.
//!
//! ## Quick Start
//!
//! ```no_run
//! use grove_vm::{SnapshotPaths, VmBuilder};
//! use std::path::Path;
//!
//! # async fn example() -> grove_vm::Result<()> {
//! let mut vm = VmBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(512)
//!     .kernel("/path/to/vmlinux")
//!     .rootfs("/path/to/rootfs.ext4")
//!     .build_with_id("vm-1")
//!     .await?;
//!
//! // Checkpoint, keep running, then roll back
//! let paths = SnapshotPaths::new(Path::new("/var/lib/grove/snapshots"), "vm-1", "root")?;
//! vm.snapshot(&paths).await?;
//! vm.restore(&paths).await?;
//!
//! vm.destroy().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle**: boot, pause, resume, shut down, kill and destroy
//! - **Snapshots**: state file plus memory file, restored into a fresh Firecracker process
//! - **Per-VM layout**: API socket and vsock UDS under `<chroot>/<vm_id>/`
//! - **Optional TAP networking**

mod api;
mod builder;
mod config;
mod error;
mod machine;
mod snapshot;

pub use api::{FirecrackerApi, API_READY_TIMEOUT};
pub use builder::VmBuilder;
pub use config::{
    MachineConfig, NetworkConfig, VsockConfig, API_SOCKET_NAME, DEFAULT_BOOT_ARGS, MAX_VCPUS, MIN_MEMORY_MIB,
    VSOCK_SOCKET_NAME,
};
pub use error::{Result, VmError};
pub use machine::{VirtualMachine, VmState};
pub use snapshot::{instance_dir, SnapshotPaths};
