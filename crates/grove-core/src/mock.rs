//! In-memory sandbox for exercising the pool and manager without KVM.
//!
//! [`MockSandbox`] honours the same state machine as the microVM sandbox and
//! lets tests inject failures. Command output comes from the
//! [`SimulatedExecutor`], so results are flagged `simulated`.

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::executor::{CommandExecutor, SimulatedExecutor};
use crate::factory::SandboxFactory;
use crate::sandbox::{
    ExecutionRequest, ExecutionResult, Sandbox, SandboxHandle, SandboxId, SandboxInfo, SandboxRecord,
    SandboxState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Failure switches for a [`MockSandbox`].
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `execute` sleeps this long before answering.
    pub execute_delay: Duration,
    /// `create_snapshot` fails.
    pub fail_snapshot: bool,
    /// `restore_snapshot` fails.
    pub fail_restore: bool,
    /// `stop` fails and moves the sandbox to `Error`.
    pub fail_stop: bool,
    /// `info` fails.
    pub fail_info: bool,
}

/// In-memory stand-in for a microVM sandbox.
pub struct MockSandbox {
    id: SandboxId,
    record: Mutex<SandboxRecord>,
    behavior: std::sync::Mutex<MockBehavior>,
    executor: SimulatedExecutor,
    destroy_calls: AtomicU32,
}

impl MockSandbox {
    /// A `Ready` mock built from `config`.
    pub fn new(config: SandboxConfig) -> Self {
        let config = config.resolved();
        let id = SandboxId::from(config.vm_id.clone());
        let mut record = SandboxRecord::new(id.clone(), config);
        record.state = SandboxState::Ready;
        Self {
            executor: SimulatedExecutor::new(id.as_str()),
            id,
            record: Mutex::new(record),
            behavior: std::sync::Mutex::new(MockBehavior::default()),
            destroy_calls: AtomicU32::new(0),
        }
    }

    /// Replace the failure switches.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Edit the failure switches in place.
    pub fn update_behavior(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Force the `Error` state.
    pub async fn mark_failed(&self) {
        self.record.lock().await.fail();
    }

    /// Overwrite the peak memory sample.
    pub async fn set_peak_memory_mb(&self, mb: f64) {
        self.record.lock().await.metrics.memory_peak_mb = mb;
    }

    /// Overwrite the error counter.
    pub async fn set_error_count(&self, count: u64) {
        self.record.lock().await.metrics.error_count = count;
    }

    /// Backdate the last-used timestamp.
    pub async fn set_last_used_at(&self, at: DateTime<Utc>) {
        self.record.lock().await.last_used_at = at;
    }

    /// Current state.
    pub async fn state(&self) -> SandboxState {
        self.record.lock().await.state
    }

    /// Number of `destroy` calls, including repeated ones.
    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &SandboxId {
        &self.id
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let mut record = self.record.lock().await;
        record.require(SandboxState::Ready, "execute")?;
        record.state = SandboxState::Running;

        let timeout = request.effective_timeout(record.config.exec_timeout);
        let delay = self.behavior().execute_delay;
        let started = tokio::time::Instant::now();
        let result = if delay > timeout {
            tokio::time::sleep(timeout).await;
            Err(CoreError::ExecutionTimeout {
                sandbox_id: self.id.to_string(),
                timeout,
            })
        } else {
            tokio::time::sleep(delay).await;
            self.executor.execute(&request, timeout).await
        };

        record.state = SandboxState::Ready;
        record.touch();
        record.metrics.record_execution(started.elapsed(), None);
        if result.is_err() {
            record.metrics.error_count += 1;
        }
        result
    }

    async fn create_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut record = self.record.lock().await;
        record.require(SandboxState::Ready, "create_snapshot")?;
        record.require_new_snapshot(snapshot_id)?;
        if self.behavior().fail_snapshot {
            record.metrics.error_count += 1;
            return Err(CoreError::Snapshot {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                message: "injected snapshot failure".into(),
            });
        }
        record.snapshots.push(snapshot_id.to_string());
        record.touch();
        Ok(())
    }

    async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut record = self.record.lock().await;
        record.require_snapshot(snapshot_id)?;
        record.require(SandboxState::Ready, "restore_snapshot")?;
        if self.behavior().fail_restore {
            record.fail();
            return Err(CoreError::Snapshot {
                sandbox_id: self.id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                message: "injected restore failure".into(),
            });
        }
        record.touch();
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<String>> {
        Ok(self.record.lock().await.snapshots.clone())
    }

    async fn info(&self) -> Result<SandboxInfo> {
        if self.behavior().fail_info {
            return Err(CoreError::Connection("injected info failure".into()));
        }
        Ok(self.record.lock().await.info())
    }

    async fn start(&self) -> Result<()> {
        let mut record = self.record.lock().await;
        record.require(SandboxState::Stopped, "start")?;
        record.state = SandboxState::Ready;
        record.metrics.restart_count += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut record = self.record.lock().await;
        match record.state {
            SandboxState::Stopped => return Ok(()),
            SandboxState::Ready | SandboxState::Running | SandboxState::Snapshot => {}
            _ => record.require(SandboxState::Ready, "stop")?,
        }
        if self.behavior().fail_stop {
            record.fail();
            return Err(CoreError::lifecycle(
                self.id.as_str(),
                "stop",
                CoreError::Connection("injected stop failure".into()),
            ));
        }
        record.state = SandboxState::Stopped;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.record.lock().await.state = SandboxState::Destroyed;
        Ok(())
    }
}

/// Builds [`MockSandbox`]es and keeps a handle to each one for inspection.
#[derive(Default)]
pub struct MockSandboxFactory {
    created: std::sync::Mutex<Vec<Arc<MockSandbox>>>,
    failures_pending: AtomicU32,
    create_delay: std::sync::Mutex<Duration>,
}

impl MockSandboxFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` creations fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Make every creation take `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Every sandbox built so far, in creation order.
    pub fn created(&self) -> Vec<Arc<MockSandbox>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of sandboxes built so far.
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The concrete mock behind `id`.
    pub fn instance(&self, id: &SandboxId) -> Option<Arc<MockSandbox>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SandboxFactory for MockSandboxFactory {
    async fn create(&self, config: SandboxConfig) -> Result<SandboxHandle> {
        let delay = *self.create_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let config = config.resolved();
        if self.take_failure() {
            return Err(CoreError::lifecycle(
                config.vm_id,
                "create",
                CoreError::Connection("injected create failure".into()),
            ));
        }

        let sandbox = Arc::new(MockSandbox::new(config));
        sandbox.record.lock().await.metrics.startup_time = delay;
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&sandbox));
        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock() -> MockSandbox {
        MockSandbox::new(SandboxConfig::default())
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let sandbox = mock();
        let result = sandbox.execute(ExecutionRequest::new(["echo", "hi"])).await.unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(sandbox.state().await, SandboxState::Ready);

        let info = sandbox.info().await.unwrap();
        assert_eq!(info.metrics.execution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_timeout_returns_to_ready() {
        let sandbox = mock();
        sandbox.update_behavior(|b| b.execute_delay = Duration::from_secs(10));
        let err = sandbox
            .execute(ExecutionRequest::new(["sleep", "1"]).timeout(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ExecutionTimeout { .. }));
        assert_eq!(sandbox.state().await, SandboxState::Ready);
        assert_eq!(sandbox.info().await.unwrap().metrics.error_count, 1);
    }

    #[tokio::test]
    async fn test_execute_requires_ready() {
        let sandbox = mock();
        sandbox.stop().await.unwrap();
        let err = sandbox.execute(ExecutionRequest::new(["true"])).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert_eq!(sandbox.state().await, SandboxState::Stopped);
    }

    #[tokio::test]
    async fn test_snapshot_then_restore_keeps_ready() {
        let sandbox = mock();
        sandbox.create_snapshot("s1").await.unwrap();
        sandbox.restore_snapshot("s1").await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Ready);
        assert_eq!(sandbox.list_snapshots().await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot_fails() {
        let sandbox = mock();
        let err = sandbox.restore_snapshot("nonexistent").await.unwrap_err();
        assert!(matches!(err, CoreError::SnapshotNotFound { .. }));
        assert_eq!(sandbox.state().await, SandboxState::Ready);
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_rejected() {
        let sandbox = mock();
        sandbox.create_snapshot("s1").await.unwrap();
        assert!(matches!(
            sandbox.create_snapshot("s1").await,
            Err(CoreError::SnapshotExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_start_counts_restarts() {
        let sandbox = mock();
        sandbox.stop().await.unwrap();
        sandbox.stop().await.unwrap();
        sandbox.start().await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Ready);
        assert_eq!(sandbox.info().await.unwrap().metrics.restart_count, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let sandbox = mock();
        sandbox.destroy().await.unwrap();
        sandbox.destroy().await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Destroyed);
        assert_eq!(sandbox.destroy_calls(), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_injection() {
        let factory = MockSandboxFactory::new();
        factory.fail_next_creates(1);
        assert!(factory.create(SandboxConfig::default()).await.is_err());

        let handle = factory.create(SandboxConfig::default()).await.unwrap();
        assert_eq!(factory.created_count(), 1);
        assert!(factory.instance(handle.id()).is_some());
    }
}
