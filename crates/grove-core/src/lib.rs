//! # grove-core
//!
//! Sandbox provisioning, pooling and snapshots for tree-search workloads.
//!
//! Each node of a search tree runs its action inside an isolated
//! Firecracker microVM. This crate keeps a bounded pool of those VMs warm,
//! hands them out to concurrent workers, and checkpoints them so the search
//! can fork and backtrack without booting from scratch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    grove-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxManager  │────▶│  HashMap<SandboxId,      │    │
//! │  │ - create()      │     │      SandboxHandle>      │    │
//! │  │ - release()     │     └──────────────────────────┘    │
//! │  │ - health_check()│                                     │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  SandboxPool    │────▶│  SandboxFactory          │    │
//! │  │ - acquire()     │     │  (microVM or mock)       │    │
//! │  │ - release()     │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ dyn Sandbox     │────▶│  VirtualMachine          │    │
//! │  │ - execute()     │     │  (from grove-vm)         │    │
//! │  │ - snapshot()    │     └──────────────────────────┘    │
//! │  └─────────────────┘                │ vsock              │
//! │           │                         ▼                    │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ CombinedSandbox │────▶│  StateStoreClient        │    │
//! │  │ VM + filesystem │     │  (subprocess)            │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  grove-agent (guest)                     │
//! │              Listening on vsock port 52                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use grove_core::{ExecutionRequest, MicroVmFactory, SandboxConfig, SandboxManager};
//! use std::sync::Arc;
//!
//! # async fn example() -> grove_core::Result<()> {
//! let template = SandboxConfig::builder()
//!     .kernel("/path/to/vmlinux")
//!     .rootfs("/path/to/rootfs.ext4")
//!     .memory_mb(512)
//!     .build_partial();
//!
//! let manager = SandboxManager::new(4, template, Arc::new(MicroVmFactory::new()))?;
//!
//! let sandbox = manager.create_sandbox(&SandboxConfig::default()).await?;
//! let result = sandbox.execute(ExecutionRequest::shell("echo hello")).await?;
//! println!("{}", result.stdout);
//!
//! sandbox.create_snapshot("node-17").await?;
//! sandbox.restore_snapshot("node-17").await?;
//!
//! manager.release_sandbox(sandbox.id()).await?;
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Warm Pooling**: bounded pool with background pre-warming and idle cleanup
//! - **Snapshots**: VM memory snapshots, optionally paired with filesystem state
//! - **Health Sweeps**: unhealthy sandboxes are destroyed, never re-pooled
//! - **Reliability**: circuit breaker and bounded exponential retry
//! - **Testability**: in-memory sandbox behind the same trait as the microVM

mod breaker;
mod client;
mod combined;
mod config;
mod error;
mod executor;
mod factory;
mod health;
mod manager;
mod microvm;
mod mock;
mod pool;
mod retry;
mod sandbox;
mod state_store;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{AgentClient, AgentExecResult, GUEST_PORT};
pub use combined::{state_store_ref, CombinedRestore, CombinedSandbox, CombinedSnapshot, COMMIT_MESSAGE_PREFIX};
pub use config::{
    ExecutionStrategy, NetworkMode, SandboxConfig, SandboxConfigBuilder, DEFAULT_DISK_MB, DEFAULT_EXEC_TIMEOUT,
    DEFAULT_MEMORY_MB, DEFAULT_VCPU_COUNT,
};
pub use error::{CoreError, Result};
pub use executor::{AgentExecutor, CommandExecutor, SimulatedExecutor};
pub use factory::{MicroVmFactory, SandboxFactory};
pub use health::{HealthChecker, HealthIssue, HealthReport, HealthSweep, HealthThresholds};
pub use manager::{SandboxManager, SandboxStats};
pub use microvm::MicroVmSandbox;
pub use mock::{MockBehavior, MockSandbox, MockSandboxFactory};
pub use pool::{PoolConfig, PoolStats, SandboxPool};
pub use retry::{RetryPolicy, DEFAULT_RETRYABLE_PATTERNS};
pub use sandbox::{
    ExecutionRequest, ExecutionResult, ResourceUsage, Sandbox, SandboxHandle, SandboxId, SandboxInfo, SandboxMetrics,
    SandboxState,
};
pub use state_store::{
    CommandOutput, CommandRunner, OperationMetrics, ProcessRunner, StateStoreClient, StateStoreConfig,
};
