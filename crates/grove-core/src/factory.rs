//! Construction of sandboxes for the pool.

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::SandboxConfig;
use crate::error::Result;
use crate::microvm::MicroVmSandbox;
use crate::retry::RetryPolicy;
use crate::sandbox::SandboxHandle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// First guest CID handed out. 0-2 are reserved by vsock.
const FIRST_GUEST_CID: u32 = 3;

/// Builds sandboxes from a fully merged config.
///
/// The pool is generic over this seam, so tests swap in the in-memory
/// implementation.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Build and start one sandbox in `Ready` state.
    async fn create(&self, config: SandboxConfig) -> Result<SandboxHandle>;
}

/// Boots Firecracker microVMs.
///
/// Boots are retried on transient errors and guarded by a circuit breaker,
/// so a broken host (missing KVM, exhausted disk) fails fast instead of
/// stalling every acquisition.
#[derive(Debug)]
pub struct MicroVmFactory {
    next_cid: AtomicU32,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl MicroVmFactory {
    /// Factory assigning guest CIDs from 3 upwards, with default retry and
    /// breaker settings.
    pub fn new() -> Self {
        Self::with_reliability(RetryPolicy::default(), CircuitBreakerConfig::default())
    }

    pub fn with_reliability(retry: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            next_cid: AtomicU32::new(FIRST_GUEST_CID),
            breaker: CircuitBreaker::new("vm-boot", breaker),
            retry,
        }
    }

    /// Breaker guarding VM boots.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn assign_cid(&self) -> u32 {
        loop {
            let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
            if cid >= FIRST_GUEST_CID && cid != u32::MAX {
                return cid;
            }
            // wrapped; skip the reserved range
        }
    }
}

impl Default for MicroVmFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxFactory for MicroVmFactory {
    async fn create(&self, config: SandboxConfig) -> Result<SandboxHandle> {
        let sandbox = self
            .breaker
            .call(|| {
                self.retry.retry("vm boot", || {
                    let mut config = config.clone();
                    if config.vsock_cid == 0 {
                        config.vsock_cid = self.assign_cid();
                    }
                    MicroVmSandbox::create(config)
                })
            })
            .await?;
        Ok(Arc::new(sandbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cids_are_unique_and_unreserved() {
        let factory = MicroVmFactory::new();
        let a = factory.assign_cid();
        let b = factory.assign_cid();
        assert_eq!(a, 3);
        assert_eq!(b, 4);
    }

    #[test]
    fn test_cid_wraparound_skips_reserved() {
        let factory = MicroVmFactory::new();
        factory.next_cid.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(factory.assign_cid(), 3);
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail_without_retry() {
        let factory = MicroVmFactory::with_reliability(
            RetryPolicy::default(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        // no kernel or rootfs configured
        let config = SandboxConfig::default();

        for _ in 0..2 {
            let err = factory.create(config.clone()).await.err().unwrap();
            assert!(!err.is_circuit_open());
        }
        // one CID per attempt, so no retries happened
        assert_eq!(factory.next_cid.load(Ordering::Relaxed), 5);

        let err = factory.create(config).await.err().unwrap();
        assert!(err.is_circuit_open());
    }
}
