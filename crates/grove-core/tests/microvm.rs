//! MicroVM sandbox tests.
//!
//! These tests require:
//! - Linux with /dev/kvm access
//! - Firecracker binary installed
//! - Kernel and a rootfs with grove-agent
//!
//! Run with: `cargo test -p grove-core -- --ignored`

use grove_core::{
    ExecutionRequest, ExecutionStrategy, MicroVmFactory, SandboxConfig, SandboxFactory, SandboxManager, SandboxState,
};
use std::path::Path;
use std::sync::Arc;

fn template() -> Option<SandboxConfig> {
    let kernel = std::env::var("GROVE_KERNEL").unwrap_or_else(|_| "/var/lib/grove/kernel/vmlinux".to_string());
    let rootfs = std::env::var("GROVE_ROOTFS").unwrap_or_else(|_| "/var/lib/grove/images/rootfs.ext4".to_string());
    if !Path::new(&kernel).exists() || !Path::new(&rootfs).exists() {
        eprintln!("Skipping test: set GROVE_KERNEL and GROVE_ROOTFS");
        return None;
    }
    let mut builder = SandboxConfig::builder().kernel(kernel).rootfs(rootfs).memory_mb(256);
    if let Ok(firecracker) = std::env::var("GROVE_FIRECRACKER") {
        builder = builder.firecracker_path(firecracker);
    }
    Some(builder.build_partial())
}

#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_microvm_execute_snapshot_restore() {
    let Some(template) = template() else {
        return;
    };
    let factory = MicroVmFactory::new();
    let sandbox = factory.create(template).await.unwrap();

    let result = sandbox.execute(ExecutionRequest::shell("echo hello")).await.unwrap();
    assert_eq!(result.stdout.trim(), "hello");
    assert!(!result.simulated);

    sandbox.create_snapshot("s1").await.unwrap();
    sandbox.restore_snapshot("s1").await.unwrap();
    let info = sandbox.info().await.unwrap();
    assert_eq!(info.state, SandboxState::Ready);
    assert_eq!(info.snapshots, vec!["s1"]);

    sandbox.destroy().await.unwrap();
    assert_eq!(sandbox.info().await.unwrap().state, SandboxState::Destroyed);
}

#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_microvm_pool_reuse() {
    let Some(template) = template() else {
        return;
    };
    let template = SandboxConfig {
        execution: Some(ExecutionStrategy::Simulated),
        ..template
    };
    let manager = SandboxManager::new(1, template, Arc::new(MicroVmFactory::new())).unwrap();

    let sandbox = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
    let id = sandbox.id().clone();
    manager.release_sandbox(&id).await.unwrap();

    let again = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
    assert_eq!(again.id(), &id);
    assert_eq!(again.info().await.unwrap().metrics.restart_count, 1);
    manager.shutdown().await.unwrap();
}
