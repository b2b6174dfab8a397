//! Health classification for managed sandboxes.
//!
//! Separate from [`SandboxManager::health_check`], which only looks at the
//! `Error` state. The checker also flags runaway memory and error counts,
//! and marks long-idle sandboxes as wasteful without calling them broken.

use crate::error::Result;
use crate::manager::SandboxManager;
use crate::sandbox::{SandboxId, SandboxInfo, SandboxState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Limits a sandbox must stay within.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Peak memory above `memory_factor * config.memory_mb` is unhealthy.
    /// Default: 2.0
    pub memory_factor: f64,
    /// More recorded errors than this is unhealthy.
    /// Default: 10
    pub max_errors: u64,
    /// Unused for longer than this raises an idle issue.
    /// Default: 30 minutes
    pub idle_threshold: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_factor: 2.0,
            max_errors: 10,
            idle_threshold: Duration::from_secs(30 * 60),
        }
    }
}

/// One finding about a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthIssue {
    /// `Error` or `Destroyed`.
    BadState { state: SandboxState },
    /// Peak memory over budget.
    MemoryExceeded { peak_mb: f64, limit_mb: f64 },
    /// Too many recorded errors.
    TooManyErrors { count: u64, limit: u64 },
    /// Unused for a long time. Soft.
    Idle { idle_secs: u64 },
    /// `info` failed.
    Unreachable { error: String },
}

impl HealthIssue {
    /// Whether this issue alone makes a sandbox unhealthy.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Idle { .. })
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadState { state } => write!(f, "state is {state}"),
            Self::MemoryExceeded { peak_mb, limit_mb } => {
                write!(f, "peak memory {peak_mb:.0} MiB exceeds {limit_mb:.0} MiB")
            }
            Self::TooManyErrors { count, limit } => write!(f, "{count} errors (limit {limit})"),
            Self::Idle { idle_secs } => write!(f, "idle for {idle_secs}s"),
            Self::Unreachable { error } => write!(f, "unreachable: {error}"),
        }
    }
}

/// Verdict for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub sandbox_id: SandboxId,
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    fn from_issues(sandbox_id: SandboxId, issues: Vec<HealthIssue>) -> Self {
        Self {
            sandbox_id,
            healthy: !issues.iter().any(HealthIssue::is_fatal),
            issues,
        }
    }
}

/// Outcome of [`HealthChecker::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSweep {
    /// Sandboxes inspected.
    pub checked: usize,
    /// Sandboxes judged unhealthy.
    pub unhealthy: usize,
    /// Unhealthy sandboxes actually destroyed.
    pub destroyed: usize,
    /// Every report with at least one issue.
    pub reports: Vec<HealthReport>,
}

/// Classifies sandboxes against [`HealthThresholds`].
#[derive(Debug, Clone, Default)]
pub struct HealthChecker {
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Judge one sandbox as of `now`.
    pub fn evaluate(&self, info: &SandboxInfo, now: DateTime<Utc>) -> HealthReport {
        let t = &self.thresholds;
        let mut issues = Vec::new();

        if matches!(info.state, SandboxState::Error | SandboxState::Destroyed) {
            issues.push(HealthIssue::BadState { state: info.state });
        }

        let limit_mb = f64::from(info.config.memory_mb) * t.memory_factor;
        if info.config.memory_mb > 0 && info.metrics.memory_peak_mb > limit_mb {
            issues.push(HealthIssue::MemoryExceeded {
                peak_mb: info.metrics.memory_peak_mb,
                limit_mb,
            });
        }

        if info.metrics.error_count > t.max_errors {
            issues.push(HealthIssue::TooManyErrors {
                count: info.metrics.error_count,
                limit: t.max_errors,
            });
        }

        // a clock step backwards reads as not idle
        let idle = (now - info.last_used_at).to_std().unwrap_or_default();
        if idle > t.idle_threshold {
            issues.push(HealthIssue::Idle {
                idle_secs: idle.as_secs(),
            });
        }

        HealthReport::from_issues(info.id.clone(), issues)
    }

    /// Evaluate every sandbox the manager tracks and destroy the unhealthy
    /// ones.
    pub async fn sweep(&self, manager: &SandboxManager) -> Result<HealthSweep> {
        let now = Utc::now();
        let mut sweep = HealthSweep::default();

        for id in manager.list_sandboxes().await {
            // released while we were iterating
            let Ok(sandbox) = manager.get_sandbox(&id).await else {
                continue;
            };
            sweep.checked += 1;

            let report = match sandbox.info().await {
                Ok(info) => self.evaluate(&info, now),
                Err(e) => HealthReport::from_issues(
                    id.clone(),
                    vec![HealthIssue::Unreachable { error: e.to_string() }],
                ),
            };

            if !report.healthy {
                sweep.unhealthy += 1;
                let issues: Vec<String> = report.issues.iter().map(ToString::to_string).collect();
                tracing::warn!(sandbox_id = %id, issues = ?issues, "Destroying unhealthy sandbox");
                match manager.destroy_sandbox(&id).await {
                    Ok(()) => sweep.destroyed += 1,
                    Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Failed to destroy unhealthy sandbox"),
                }
            } else if !report.issues.is_empty() {
                tracing::info!(sandbox_id = %id, issues = report.issues.len(), "Sandbox has soft health issues");
            }

            if !report.issues.is_empty() {
                sweep.reports.push(report);
            }
        }

        tracing::debug!(
            checked = sweep.checked,
            unhealthy = sweep.unhealthy,
            destroyed = sweep.destroyed,
            "Health sweep complete"
        );
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::mock::MockSandboxFactory;
    use crate::pool::PoolConfig;
    use crate::sandbox::SandboxMetrics;
    use std::sync::Arc;

    fn info(memory_mb: u32) -> SandboxInfo {
        let now = Utc::now();
        SandboxInfo {
            id: SandboxId::from("sb-1"),
            state: SandboxState::Ready,
            config: SandboxConfig::builder().memory_mb(memory_mb).build_partial(),
            metrics: SandboxMetrics::default(),
            created_at: now,
            last_used_at: now,
            snapshots: Vec::new(),
        }
    }

    #[test]
    fn test_healthy_sandbox() {
        let checker = HealthChecker::default();
        let report = checker.evaluate(&info(256), Utc::now());
        assert!(report.healthy);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_bad_states_are_unhealthy() {
        let checker = HealthChecker::default();
        for state in [SandboxState::Error, SandboxState::Destroyed] {
            let mut i = info(256);
            i.state = state;
            let report = checker.evaluate(&i, Utc::now());
            assert!(!report.healthy);
            assert_eq!(report.issues, vec![HealthIssue::BadState { state }]);
        }
    }

    #[test]
    fn test_memory_over_twice_budget() {
        let checker = HealthChecker::default();
        let mut i = info(256);
        i.metrics.memory_peak_mb = 512.0;
        assert!(checker.evaluate(&i, Utc::now()).healthy);

        i.metrics.memory_peak_mb = 513.0;
        let report = checker.evaluate(&i, Utc::now());
        assert!(!report.healthy);
        assert!(matches!(report.issues[0], HealthIssue::MemoryExceeded { .. }));
    }

    #[test]
    fn test_error_count_threshold() {
        let checker = HealthChecker::default();
        let mut i = info(256);
        i.metrics.error_count = 10;
        assert!(checker.evaluate(&i, Utc::now()).healthy);
        i.metrics.error_count = 11;
        assert!(!checker.evaluate(&i, Utc::now()).healthy);
    }

    #[test]
    fn test_idle_is_soft() {
        let checker = HealthChecker::default();
        let i = info(256);
        let later = i.last_used_at + chrono::Duration::minutes(45);
        let report = checker.evaluate(&i, later);
        assert!(report.healthy);
        assert_eq!(report.issues, vec![HealthIssue::Idle { idle_secs: 45 * 60 }]);
        assert!(report.issues[0].to_string().contains("idle"));
    }

    #[tokio::test]
    async fn test_sweep_destroys_unhealthy() {
        let factory = Arc::new(MockSandboxFactory::new());
        let config = PoolConfig {
            capacity: 4,
            warm_fraction: 0.0,
            template: SandboxConfig::builder().memory_mb(128).build_partial(),
            ..Default::default()
        };
        let manager = SandboxManager::with_pool_config(config, factory.clone()).unwrap();

        let healthy = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let hog = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let noisy = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();
        let idle = manager.create_sandbox(&SandboxConfig::default()).await.unwrap();

        factory.instance(hog.id()).unwrap().set_peak_memory_mb(1024.0).await;
        factory.instance(noisy.id()).unwrap().set_error_count(50).await;
        factory
            .instance(idle.id())
            .unwrap()
            .set_last_used_at(Utc::now() - chrono::Duration::hours(2))
            .await;

        let sweep = HealthChecker::default().sweep(&manager).await.unwrap();
        assert_eq!(sweep.checked, 4);
        assert_eq!(sweep.unhealthy, 2);
        assert_eq!(sweep.destroyed, 2);
        assert_eq!(sweep.reports.len(), 3);

        let mut remaining = manager.list_sandboxes().await;
        remaining.sort();
        let mut expected = vec![healthy.id().clone(), idle.id().clone()];
        expected.sort();
        assert_eq!(remaining, expected);
        manager.shutdown().await.unwrap();
    }
}
