//! Boots real microVMs. Needs /dev/kvm, a firecracker binary, and guest
//! images at `GROVE_KERNEL` / `GROVE_ROOTFS`.
//!
//! Run with: `cargo test -p grove-vm -- --ignored`

use grove_vm::{SnapshotPaths, VirtualMachine, VmBuilder, VmError, VmState};
use std::path::PathBuf;

fn guest_images() -> Option<(PathBuf, PathBuf)> {
    let kernel = std::env::var_os("GROVE_KERNEL")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/grove/vmlinux"));
    let rootfs = std::env::var_os("GROVE_ROOTFS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/grove/rootfs.ext4"));

    if kernel.exists() && rootfs.exists() {
        Some((kernel, rootfs))
    } else {
        eprintln!("skipping: set GROVE_KERNEL and GROVE_ROOTFS to bootable images");
        None
    }
}

async fn boot(id: &str) -> Option<VirtualMachine> {
    let (kernel, rootfs) = guest_images()?;
    let vm = VmBuilder::new()
        .memory_mib(256)
        .kernel(kernel)
        .rootfs(rootfs)
        .with_vsock(3)
        .build_with_id(id)
        .await
        .expect("boot");
    Some(vm)
}

#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_boot_and_destroy() {
    let Some(vm) = boot("grove-it-boot").await else {
        return;
    };
    assert_eq!(vm.state(), VmState::Running);
    assert!(vm.socket_path().ends_with("grove-it-boot/firecracker.socket"));
    assert!(vm.vsock_uds_path().unwrap().ends_with("grove-it-boot/v.sock"));
    vm.destroy().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_pause_resume_state_machine() {
    let Some(mut vm) = boot("grove-it-pause").await else {
        return;
    };

    let err = vm.resume().await.unwrap_err();
    assert!(matches!(err, VmError::InvalidState { state: VmState::Running, .. }));

    vm.pause().await.unwrap();
    assert_eq!(vm.state(), VmState::Paused);
    vm.resume().await.unwrap();
    assert_eq!(vm.state(), VmState::Running);

    vm.destroy().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_snapshot_then_restore_in_new_process() {
    let Some(mut vm) = boot("grove-it-snapshot").await else {
        return;
    };
    let snapshot_root = tempfile::tempdir().unwrap();
    let paths = SnapshotPaths::new(snapshot_root.path(), vm.id(), "checkpoint").unwrap();

    vm.snapshot(&paths).await.unwrap();
    paths.verify().await.unwrap();
    // the write pauses, then resumes a running VM
    assert_eq!(vm.state(), VmState::Running);

    vm.restore(&paths).await.unwrap();
    assert_eq!(vm.state(), VmState::Running);

    vm.destroy().await.unwrap();
}
