//! Sandbox manager: bookkeeping over one pool.

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::factory::SandboxFactory;
use crate::pool::{PoolConfig, PoolStats, SandboxPool};
use crate::sandbox::{SandboxHandle, SandboxId, SandboxMetrics, SandboxState};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

/// Derived report over every tracked sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SandboxStats {
    /// Tracked sandboxes.
    pub total: usize,
    /// Tracked sandboxes per state, zero entries included. Sandboxes that
    /// fail to report are counted under `"unreachable"`.
    pub by_state: BTreeMap<String, usize>,
    /// Aggregate metrics, see [`SandboxManager::get_metrics`].
    pub metrics: SandboxMetrics,
    /// Pool statistics.
    pub pool: PoolStats,
}

struct ManagerInner {
    sandboxes: RwLock<HashMap<SandboxId, SandboxHandle>>,
    pool: SandboxPool,
}

impl ManagerInner {
    async fn unregister(&self, id: &SandboxId) -> Result<SandboxHandle> {
        self.sandboxes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    async fn destroy_sandbox(&self, id: &SandboxId) -> Result<()> {
        let sandbox = self.unregister(id).await?;
        self.pool.discard(sandbox).await?;
        tracing::info!(sandbox_id = %id, "Sandbox destroyed");
        Ok(())
    }

    async fn snapshot(&self) -> Vec<SandboxHandle> {
        self.sandboxes.read().await.values().cloned().collect()
    }

    async fn health_check(&self) -> Result<()> {
        let mut cleaned = 0;
        for sandbox in self.snapshot().await {
            let reason = match sandbox.info().await {
                Ok(info) if info.state == SandboxState::Error => "error state",
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(sandbox_id = %sandbox.id(), error = %e, "Health probe failed");
                    "info failed"
                }
            };
            tracing::warn!(sandbox_id = %sandbox.id(), reason, "Cleaning up unhealthy sandbox");
            match self.destroy_sandbox(sandbox.id()).await {
                Ok(()) => cleaned += 1,
                // released or destroyed concurrently
                Err(CoreError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Failed to destroy unhealthy sandbox")
                }
            }
        }
        if cleaned > 0 {
            return Err(CoreError::UnhealthySandboxes { cleaned });
        }
        Ok(())
    }
}

/// Manages the sandboxes checked out of one [`SandboxPool`].
///
/// The manager tracks every sandbox it hands out by ID, aggregates their
/// metrics and sweeps out broken ones. Creation and release go through the
/// pool, so pool capacity bounds the number of live sandboxes.
///
/// # Thread Safety
///
/// The registry sits behind an async `RwLock`: lookups and stats take the
/// read side, registration and removal the write side. The lock is never
/// held across a pool or sandbox call.
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
    monitor: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl SandboxManager {
    /// Manager over a pool of `pool_size` sandboxes built from `template`.
    pub fn new(pool_size: usize, template: SandboxConfig, factory: Arc<dyn SandboxFactory>) -> Result<Self> {
        Self::with_pool_config(PoolConfig::new(pool_size, template), factory)
    }

    /// Manager over a pool with full configuration.
    pub fn with_pool_config(config: PoolConfig, factory: Arc<dyn SandboxFactory>) -> Result<Self> {
        tracing::info!(capacity = config.capacity, "Creating sandbox manager");
        let pool = SandboxPool::new(config, factory)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                sandboxes: RwLock::new(HashMap::new()),
                pool,
            }),
            monitor: Mutex::new(None),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SandboxPool {
        &self.inner.pool
    }

    /// Acquire a sandbox from the pool and start tracking it.
    pub async fn create_sandbox(&self, overrides: &SandboxConfig) -> Result<SandboxHandle> {
        let sandbox = self.inner.pool.acquire(overrides).await?;
        self.register(sandbox).await
    }

    /// Like [`create_sandbox`](Self::create_sandbox) with an explicit wait bound.
    pub async fn create_sandbox_within(&self, overrides: &SandboxConfig, timeout: Duration) -> Result<SandboxHandle> {
        let sandbox = self.inner.pool.acquire_within(overrides, timeout).await?;
        self.register(sandbox).await
    }

    async fn register(&self, sandbox: SandboxHandle) -> Result<SandboxHandle> {
        let id = sandbox.id().clone();
        self.inner
            .sandboxes
            .write()
            .await
            .insert(id.clone(), Arc::clone(&sandbox));
        tracing::info!(sandbox_id = %id, "Sandbox registered");
        Ok(sandbox)
    }

    /// Look up a tracked sandbox.
    pub async fn get_sandbox(&self, id: &SandboxId) -> Result<SandboxHandle> {
        self.inner
            .sandboxes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// IDs of every tracked sandbox, sorted.
    pub async fn list_sandboxes(&self) -> Vec<SandboxId> {
        let mut ids: Vec<_> = self.inner.sandboxes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of tracked sandboxes.
    pub async fn count(&self) -> usize {
        self.inner.sandboxes.read().await.len()
    }

    /// Stop tracking a sandbox and hand it back to the pool.
    pub async fn release_sandbox(&self, id: &SandboxId) -> Result<()> {
        let sandbox = self.inner.unregister(id).await?;
        self.inner.pool.release(sandbox).await?;
        tracing::debug!(sandbox_id = %id, "Sandbox released");
        Ok(())
    }

    /// Stop tracking a sandbox and destroy it.
    pub async fn destroy_sandbox(&self, id: &SandboxId) -> Result<()> {
        self.inner.destroy_sandbox(id).await
    }

    /// Aggregate metrics over every tracked sandbox.
    ///
    /// Timings are averaged, counters and memory figures summed and CPU
    /// averaged. Sandboxes that fail to report are skipped. Returns zeroed
    /// metrics when nothing is tracked.
    pub async fn get_metrics(&self) -> SandboxMetrics {
        let mut infos = Vec::new();
        for sandbox in self.inner.snapshot().await {
            if let Ok(info) = sandbox.info().await {
                infos.push(info.metrics);
            }
        }
        aggregate(&infos)
    }

    /// Per-state counts, aggregate metrics and pool statistics.
    pub async fn get_sandbox_stats(&self) -> SandboxStats {
        let sandboxes = self.inner.snapshot().await;
        let mut by_state: BTreeMap<String, usize> =
            SandboxState::ALL.iter().map(|state| (state.to_string(), 0)).collect();
        let mut metrics = Vec::with_capacity(sandboxes.len());
        for sandbox in &sandboxes {
            let key = match sandbox.info().await {
                Ok(info) => {
                    metrics.push(info.metrics);
                    info.state.to_string()
                }
                Err(_) => "unreachable".to_string(),
            };
            *by_state.entry(key).or_insert(0) += 1;
        }
        SandboxStats {
            total: sandboxes.len(),
            by_state,
            metrics: aggregate(&metrics),
            pool: self.inner.pool.stats(),
        }
    }

    /// Destroy every tracked sandbox that is in `Error` or fails to report.
    ///
    /// Returns [`CoreError::UnhealthySandboxes`] with the count when anything
    /// was cleaned up. That error is a report, not a failure of the sweep.
    pub async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    /// Run [`health_check`](Self::health_check) every `interval` until
    /// shutdown. Replaces a monitor that is already running.
    pub fn start_health_monitor(&self, interval: Duration) {
        let stop = Arc::new(Notify::new());
        let inner = Arc::clone(&self.inner);
        let signal = Arc::clone(&stop);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = signal.notified() => break,

                    _ = ticker.tick() => match inner.health_check().await {
                        Ok(()) => tracing::trace!("Health check passed"),
                        Err(CoreError::UnhealthySandboxes { cleaned }) => {
                            tracing::warn!(cleaned, "Health check cleaned up sandboxes")
                        }
                        Err(e) => tracing::error!(error = %e, "Health check failed"),
                    },
                }
            }
            tracing::debug!("Health monitor exited");
        });

        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((handle, stop));
        if let Some((handle, stop)) = previous {
            stop.notify_one();
            handle.abort();
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
    }

    /// Destroy every tracked sandbox, then shut the pool down.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down sandbox manager");

        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((handle, stop)) = monitor {
            stop.notify_one();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Health monitor panicked");
            }
        }

        let tracked: Vec<SandboxHandle> = self
            .inner
            .sandboxes
            .write()
            .await
            .drain()
            .map(|(_, sandbox)| sandbox)
            .collect();
        let count = tracked.len();
        futures::future::join_all(tracked.into_iter().map(|sandbox| self.inner.pool.discard(sandbox))).await;

        self.inner.pool.shutdown().await?;
        tracing::info!(destroyed = count, "Sandbox manager shut down");
        Ok(())
    }
}

fn aggregate(all: &[SandboxMetrics]) -> SandboxMetrics {
    let mut total = SandboxMetrics::default();
    if all.is_empty() {
        return total;
    }
    let n = all.len() as u32;
    let mean = |f: fn(&SandboxMetrics) -> Duration| all.iter().map(f).sum::<Duration>() / n;

    total.startup_time = mean(|m| m.startup_time);
    total.snapshot_time = mean(|m| m.snapshot_time);
    total.restore_time = mean(|m| m.restore_time);
    total.execution_time = mean(|m| m.execution_time);
    total.cpu_avg_percent = all.iter().map(|m| m.cpu_avg_percent).sum::<f64>() / n as f64;
    for m in all {
        total.execution_count += m.execution_count;
        total.sample_count += m.sample_count;
        total.memory_current_mb += m.memory_current_mb;
        total.memory_peak_mb += m.memory_peak_mb;
        total.network_rx_bytes += m.network_rx_bytes;
        total.network_tx_bytes += m.network_tx_bytes;
        total.error_count += m.error_count;
        total.restart_count += m.restart_count;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockSandboxFactory};
    use crate::sandbox::ExecutionRequest;

    fn manager(pool_size: usize) -> (SandboxManager, Arc<MockSandboxFactory>) {
        let factory = Arc::new(MockSandboxFactory::new());
        let config = PoolConfig {
            capacity: pool_size,
            warm_fraction: 0.0,
            ..Default::default()
        };
        let manager = SandboxManager::with_pool_config(config, factory.clone()).unwrap();
        (manager, factory)
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let (manager, _) = manager(3);
        let a = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let b = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();

        assert_eq!(manager.count().await, 2);
        assert_eq!(manager.get_sandbox(a.id()).await.unwrap().id(), a.id());
        let mut expected = vec![a.id().clone(), b.id().clone()];
        expected.sort();
        assert_eq!(manager.list_sandboxes().await, expected);

        let missing = SandboxId::from("missing");
        assert!(matches!(manager.get_sandbox(&missing).await, Err(CoreError::NotFound(_))));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_returns_to_pool() {
        let (manager, _) = manager(2);
        let sandbox = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        manager.release_sandbox(sandbox.id()).await.unwrap();

        assert_eq!(manager.count().await, 0);
        assert_eq!(manager.pool().stats().available_count, 1);
        assert!(matches!(
            manager.release_sandbox(sandbox.id()).await,
            Err(CoreError::NotFound(_))
        ));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_frees_capacity() {
        let (manager, factory) = manager(1);
        let sandbox = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        manager.destroy_sandbox(sandbox.id()).await.unwrap();

        assert_eq!(manager.count().await, 0);
        assert_eq!(factory.instance(sandbox.id()).unwrap().state().await, SandboxState::Destroyed);
        assert!(manager.create_sandbox(&SandboxConfig::default()).await.is_ok());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_empty_is_zero() {
        let (manager, _) = manager(1);
        assert_eq!(manager.get_metrics().await, SandboxMetrics::default());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_aggregate() {
        let (manager, factory) = manager(2);
        let a = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let b = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        a.execute(ExecutionRequest::new(["echo", "a"])).await.unwrap();
        b.execute(ExecutionRequest::new(["echo", "b"])).await.unwrap();
        b.execute(ExecutionRequest::new(["true"])).await.unwrap();
        factory.instance(a.id()).unwrap().set_error_count(2).await;
        factory.instance(b.id()).unwrap().set_error_count(3).await;

        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.execution_count, 3);
        assert_eq!(metrics.error_count, 5);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sandbox_stats_by_state() {
        let (manager, factory) = manager(3);
        let a = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let _b = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let c = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        factory.instance(a.id()).unwrap().mark_failed().await;
        factory
            .instance(c.id())
            .unwrap()
            .set_behavior(MockBehavior { fail_info: true, ..Default::default() });

        let stats = manager.get_sandbox_stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_state.get("Error"), Some(&1));
        assert_eq!(stats.by_state.get("Ready"), Some(&1));
        assert_eq!(stats.by_state.get("unreachable"), Some(&1));
        assert_eq!(stats.by_state.get("Stopped"), Some(&0));
        assert_eq!(stats.pool.active_count, 3);
        assert!(serde_json::to_string(&stats).is_ok());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_reports_cleanup() {
        let (manager, factory) = manager(3);
        let a = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let b = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let healthy = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();

        assert!(manager.health_check().await.is_ok());

        factory.instance(a.id()).unwrap().mark_failed().await;
        factory
            .instance(b.id())
            .unwrap()
            .update_behavior(|behavior| behavior.fail_info = true);

        let err = manager.health_check().await.unwrap_err();
        assert!(matches!(err, CoreError::UnhealthySandboxes { cleaned: 2 }));
        assert_eq!(manager.list_sandboxes().await, vec![healthy.id().clone()]);
        assert_eq!(manager.pool().stats().destroyed_count, 2);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_sweeps() {
        let (manager, factory) = manager(2);
        let sandbox = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        manager.start_health_monitor(Duration::from_secs(10));
        factory.instance(sandbox.id()).unwrap().mark_failed().await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(manager.count().await, 0);
        manager.shutdown().await.unwrap();
        assert!(manager.monitor.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_destroys_tracked() {
        let (manager, factory) = manager(2);
        let a = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let b = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        manager.release_sandbox(b.id()).await.unwrap();

        manager.shutdown().await.unwrap();
        assert_eq!(manager.count().await, 0);
        assert_eq!(factory.instance(a.id()).unwrap().state().await, SandboxState::Destroyed);
        assert_eq!(factory.instance(b.id()).unwrap().state().await, SandboxState::Destroyed);
        assert!(matches!(
            manager.create_sandbox(&SandboxConfig::default()).await,
            Err(CoreError::PoolShutdown)
        ));
    }
}
