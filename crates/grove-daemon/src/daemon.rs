//! The long-running host process around one [`SandboxManager`].

use crate::config::DaemonConfig;
use grove_core::{HealthChecker, HealthThresholds, SandboxFactory, SandboxManager, StateStoreClient};
use std::future::Future;
use std::sync::Arc;

pub struct Daemon {
    config: DaemonConfig,
    manager: SandboxManager,
    checker: HealthChecker,
    store: Option<StateStoreClient>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, factory: Arc<dyn SandboxFactory>) -> anyhow::Result<Self> {
        let manager = SandboxManager::with_pool_config(config.pool_config(), factory)?;
        let store = config.state_store().map(StateStoreClient::new);
        Ok(Self {
            config,
            manager,
            checker: HealthChecker::new(HealthThresholds::default()),
            store,
        })
    }

    pub fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    /// Initialize the state store's working directory, if one is
    /// configured, then start the health monitor.
    ///
    /// An initialization failure is logged and does not stop the daemon.
    pub async fn start(&self) {
        if let Some(store) = &self.store {
            match store.initialize().await {
                Ok(metrics) => tracing::info!(
                    elapsed_ms = metrics.duration.as_millis() as u64,
                    "State store initialized"
                ),
                Err(e) => tracing::warn!(error = %e, "State store initialization failed"),
            }
        }
        self.manager.start_health_monitor(self.config.health_interval);
    }

    /// One periodic pass: threshold-based sweep, then a stats line.
    pub async fn tick(&self) {
        match self.checker.sweep(&self.manager).await {
            Ok(sweep) if sweep.unhealthy > 0 => tracing::warn!(
                checked = sweep.checked,
                unhealthy = sweep.unhealthy,
                destroyed = sweep.destroyed,
                "Health sweep found unhealthy sandboxes"
            ),
            Ok(sweep) => tracing::debug!(checked = sweep.checked, "Health sweep clean"),
            Err(e) => tracing::error!(error = %e, "Health sweep failed"),
        }

        let stats = self.manager.get_sandbox_stats().await;
        match serde_json::to_string(&stats) {
            Ok(json) => tracing::info!(
                total = stats.total,
                available = stats.pool.available_count,
                utilization = stats.pool.pool_utilization,
                stats = %json,
                "Sandbox stats"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize stats"),
        }
    }

    /// Tick every stats interval until `shutdown` resolves, then tear down.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.stats_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                _ = ticker.tick() => self.tick().await,
            }
        }

        tracing::info!("Received shutdown signal, cleaning up...");
        self.manager.shutdown().await?;
        tracing::info!("Daemon shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::{MockSandboxFactory, SandboxConfig, SandboxState};
    use std::time::Duration;

    fn daemon(factory: Arc<MockSandboxFactory>) -> Daemon {
        let config = DaemonConfig {
            pool_size: 2,
            stats_interval: Duration::from_secs(10),
            ..DaemonConfig::default()
        };
        Daemon::new(config, factory).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shuts_down_everything() {
        let factory = Arc::new(MockSandboxFactory::new());
        let d = daemon(factory.clone());
        d.start().await;
        let sandbox = d.manager().create_sandbox(&SandboxConfig::default()).await.unwrap();
        let mock = factory.instance(sandbox.id()).unwrap();

        d.run_until(tokio::time::sleep(Duration::from_secs(25))).await.unwrap();

        assert!(d.manager().pool().is_shutdown());
        assert_eq!(d.manager().count().await, 0);
        assert_eq!(mock.state().await, SandboxState::Destroyed);
    }

    #[tokio::test]
    async fn test_tick_destroys_failed_sandbox() {
        let factory = Arc::new(MockSandboxFactory::new());
        let d = daemon(factory.clone());
        let sandbox = d.manager().create_sandbox(&SandboxConfig::default()).await.unwrap();
        factory.instance(sandbox.id()).unwrap().mark_failed().await;

        d.tick().await;
        assert_eq!(d.manager().count().await, 0);
        d.manager().shutdown().await.unwrap();
    }
}
