//! Bounded sandbox pool with pre-warming.
//!
//! The pool hands out sandboxes on [`acquire`](SandboxPool::acquire), takes
//! them back on [`release`](SandboxPool::release), and keeps a fraction of
//! its capacity booted and parked in the background.
//!
//! # Architecture
//!
//! All bookkeeping sits behind one lock: the idle queue, the checked-out set
//! and a count of slots reserved by work in flight (a construction, a
//! restart on acquire, a reset on release). At every instant
//!
//! ```text
//! active + idle + pending <= capacity
//! ```
//!
//! Slots are reserved with an RAII guard, so a cancelled acquisition gives
//! its slot back. Callers blocked at capacity wait on a [`Notify`] that fires
//! whenever an instance is parked or a slot is freed.
//!
//! # Example
//!
//! ```ignore
//! use grove_core::{MockSandboxFactory, PoolConfig, SandboxConfig, SandboxPool};
//! use std::sync::Arc;
//!
//! let pool = SandboxPool::new(PoolConfig::new(4, SandboxConfig::default()), Arc::new(MockSandboxFactory::new()))?;
//!
//! // Served from the idle queue once the pool is warm
//! let sandbox = pool.acquire(&SandboxConfig::default()).await?;
//! pool.release(sandbox).await?;
//!
//! pool.shutdown().await?;
//! ```

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::factory::SandboxFactory;
use crate::sandbox::{SandboxHandle, SandboxId, SandboxState};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the sandbox pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of sandboxes, idle and checked out together.
    /// Default: 4
    pub capacity: usize,

    /// How long `acquire` waits for a free slot.
    /// Default: 30 seconds
    pub acquire_timeout: Duration,

    /// Interval of the background maintenance loop.
    /// Default: 30 seconds
    pub maintenance_interval: Duration,

    /// Idle instances unused for this long are destroyed.
    /// Default: 5 minutes
    pub idle_timeout: Duration,

    /// Fraction of capacity kept warm in the idle queue.
    /// Default: 0.25
    pub warm_fraction: f64,

    /// Weight of a new sample in the startup-time moving average.
    /// Default: 0.1
    pub ewma_weight: f64,

    /// Template merged under every caller override.
    pub template: SandboxConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            acquire_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            warm_fraction: 0.25,
            ewma_weight: 0.1,
            template: SandboxConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Pool of `capacity` sandboxes built from `template`.
    pub fn new(capacity: usize, template: SandboxConfig) -> Self {
        Self {
            capacity,
            template,
            ..Default::default()
        }
    }

    /// Number of idle instances the maintenance loop aims for.
    pub fn warm_target(&self) -> usize {
        ((self.capacity as f64 * self.warm_fraction).ceil() as usize).min(self.capacity)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CoreError::Config("pool capacity must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.warm_fraction) {
            return Err(CoreError::Config(format!(
                "warm_fraction must be within 0.0-1.0, got {}",
                self.warm_fraction
            )));
        }
        if !(self.ewma_weight > 0.0 && self.ewma_weight <= 1.0) {
            return Err(CoreError::Config(format!(
                "ewma_weight must be within (0.0, 1.0], got {}",
                self.ewma_weight
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(CoreError::Config("maintenance_interval must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Configured capacity.
    pub total_capacity: usize,
    /// Parked instances ready for reuse.
    pub available_count: usize,
    /// Checked-out instances.
    pub active_count: usize,
    /// Slots held by constructions, restarts and resets in flight.
    pub pending_count: usize,
    /// Successful constructions.
    pub created_count: u64,
    /// Instances destroyed by the pool.
    pub destroyed_count: u64,
    /// Failed constructions.
    pub error_count: u64,
    /// Acquisitions served from the idle queue.
    pub warm_hits: u64,
    /// Acquisitions that had to construct.
    pub cold_starts: u64,
    /// Moving average of construction time.
    pub average_startup_time: Duration,
    /// `active / capacity`.
    pub pool_utilization: f64,
    /// Failed share of construction attempts, `errors / (created + errors)`.
    /// Zero before the first attempt.
    pub error_rate: f64,
}

// ============================================================================
// Pool Implementation
// ============================================================================

struct IdleEntry {
    sandbox: SandboxHandle,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleEntry>,
    active: HashMap<SandboxId, SandboxHandle>,
    pending: usize,
    created: u64,
    destroyed: u64,
    errors: u64,
    warm_hits: u64,
    cold_starts: u64,
    avg_startup_secs: Option<f64>,
    shutdown: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.active.len() + self.idle.len() + self.pending
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn SandboxFactory>,
    state: Mutex<PoolState>,
    /// Fires when an instance is parked or a slot is freed.
    freed: Notify,
    /// Wakes the maintenance loop on shutdown.
    shutdown_notify: Notify,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot. The caller holds the state lock.
    fn reserve(self: &Arc<Self>, state: &mut PoolState, sandbox: Option<SandboxHandle>) -> Reservation {
        state.pending += 1;
        Reservation {
            inner: Arc::clone(self),
            sandbox,
            armed: true,
        }
    }

    /// Build a sandbox from the template merged with `overrides`.
    async fn construct(&self, overrides: &SandboxConfig) -> Result<SandboxHandle> {
        let config = self.config.template.merged_with(overrides);
        let started = Instant::now();
        match self.factory.create(config).await {
            Ok(sandbox) => {
                let sample = started.elapsed().as_secs_f64();
                let mut state = self.lock_state();
                state.created += 1;
                let weight = self.config.ewma_weight;
                state.avg_startup_secs = Some(match state.avg_startup_secs {
                    None => sample,
                    Some(avg) => avg * (1.0 - weight) + sample * weight,
                });
                drop(state);
                tracing::debug!(
                    sandbox_id = %sandbox.id(),
                    elapsed_ms = (sample * 1000.0) as u64,
                    "Pool constructed sandbox"
                );
                Ok(sandbox)
            }
            Err(e) => {
                self.lock_state().errors += 1;
                tracing::warn!(error = %e, "Pool failed to construct sandbox");
                Err(e)
            }
        }
    }

    /// Destroy an instance the pool no longer tracks.
    async fn destroy(&self, sandbox: SandboxHandle, reason: &'static str) {
        let id = sandbox.id().clone();
        tracing::debug!(sandbox_id = %id, reason, "Destroying pooled sandbox");
        if let Err(e) = sandbox.destroy().await {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to destroy sandbox");
        }
        self.lock_state().destroyed += 1;
        self.freed.notify_waiters();
    }

    /// Drop idle instances unused for longer than `idle_timeout`.
    async fn cleanup_idle(&self) -> usize {
        let expired: Vec<SandboxHandle> = {
            let mut state = self.lock_state();
            let timeout = self.config.idle_timeout;
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|entry| entry.idle_since.elapsed() >= timeout);
            state.idle = kept;
            expired.into_iter().map(|entry| entry.sandbox).collect()
        };
        let count = expired.len();
        if count > 0 {
            tracing::info!(count, "Destroying idle sandboxes past idle timeout");
        }
        for sandbox in expired {
            self.destroy(sandbox, "idle timeout").await;
        }
        count
    }

    /// Construct idle instances until the warm target is met.
    async fn top_up(self: &Arc<Self>) -> usize {
        let target = self.config.warm_target();
        let mut added = 0;
        loop {
            let reservation = {
                let mut state = self.lock_state();
                if state.shutdown || state.idle.len() >= target || state.occupied() >= self.config.capacity {
                    break;
                }
                self.reserve(&mut state, None)
            };

            let sandbox = match self.construct(&SandboxConfig::default()).await {
                Ok(sandbox) => sandbox,
                // retried on the next tick
                Err(_) => break,
            };
            if let Err(e) = sandbox.stop().await {
                tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Failed to park pre-warmed sandbox");
                reservation.discard(sandbox, "park failed").await;
                break;
            }
            reservation.park(sandbox).await;
            added += 1;
        }
        if added > 0 {
            tracing::debug!(added, target, "Pre-warmed sandboxes");
        }
        added
    }

    async fn maintenance_loop(self: Arc<Self>) {
        tracing::debug!("Maintenance loop started");
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_notify.notified() => {
                    tracing::debug!("Maintenance loop received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if self.lock_state().shutdown {
                        break;
                    }
                    self.cleanup_idle().await;
                    self.top_up().await;
                }
            }
        }
        tracing::debug!("Maintenance loop exited");
    }
}

/// A slot held by work in flight.
///
/// Dropping an armed reservation frees the slot and destroys any sandbox it
/// still holds.
struct Reservation {
    inner: Arc<PoolInner>,
    sandbox: Option<SandboxHandle>,
    armed: bool,
}

impl Reservation {
    fn disarm(&mut self) {
        self.armed = false;
        self.sandbox = None;
    }

    /// Hand the slot over to the checked-out set.
    async fn activate(mut self, sandbox: SandboxHandle) -> Result<SandboxHandle> {
        self.disarm();
        let shut_down = {
            let mut state = self.inner.lock_state();
            state.pending -= 1;
            if !state.shutdown {
                state.active.insert(sandbox.id().clone(), Arc::clone(&sandbox));
            }
            state.shutdown
        };
        if shut_down {
            self.inner.destroy(sandbox, "pool shut down").await;
            return Err(CoreError::PoolShutdown);
        }
        Ok(sandbox)
    }

    /// Hand the slot over to the idle queue.
    async fn park(mut self, sandbox: SandboxHandle) {
        self.disarm();
        let rejected = {
            let mut state = self.inner.lock_state();
            state.pending -= 1;
            if state.shutdown {
                Some("pool shut down")
            } else if state.idle.len() >= self.inner.config.capacity {
                Some("idle queue full")
            } else {
                state.idle.push_back(IdleEntry {
                    sandbox: Arc::clone(&sandbox),
                    idle_since: Instant::now(),
                });
                None
            }
        };
        match rejected {
            Some(reason) => self.inner.destroy(sandbox, reason).await,
            None => self.inner.freed.notify_waiters(),
        }
    }

    /// Give up the slot and destroy the sandbox.
    async fn discard(mut self, sandbox: SandboxHandle, reason: &'static str) {
        self.disarm();
        self.inner.lock_state().pending -= 1;
        self.inner.destroy(sandbox, reason).await;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.lock_state().pending -= 1;
        if let Some(sandbox) = self.sandbox.take() {
            let inner = Arc::clone(&self.inner);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { inner.destroy(sandbox, "acquisition cancelled").await });
                }
                Err(_) => {
                    tracing::warn!(sandbox_id = %sandbox.id(), "No runtime to destroy sandbox of cancelled acquisition");
                }
            }
        }
        self.inner.freed.notify_waiters();
    }
}

enum Step {
    Reuse(Reservation, SandboxHandle),
    Create(Reservation),
    Wait,
}

/// A bounded pool of sandboxes with background pre-warming.
///
/// Construct inside a Tokio runtime: the maintenance task is spawned by
/// [`new`](Self::new) and stopped by [`shutdown`](Self::shutdown).
pub struct SandboxPool {
    inner: Arc<PoolInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    /// Create a pool and start its maintenance task.
    pub fn new(config: PoolConfig, factory: Arc<dyn SandboxFactory>) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            capacity = config.capacity,
            warm_target = config.warm_target(),
            maintenance_interval_ms = config.maintenance_interval.as_millis() as u64,
            "Creating sandbox pool"
        );

        let inner = Arc::new(PoolInner {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            freed: Notify::new(),
            shutdown_notify: Notify::new(),
        });
        let handle = tokio::spawn(Arc::clone(&inner).maintenance_loop());

        Ok(Self {
            inner,
            maintenance: Mutex::new(Some(handle)),
        })
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a sandbox, waiting up to `acquire_timeout`.
    pub async fn acquire(&self, overrides: &SandboxConfig) -> Result<SandboxHandle> {
        self.acquire_within(overrides, self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a sandbox, waiting up to `timeout` for a free slot.
    ///
    /// An idle instance is reused when one is parked; `overrides` only
    /// apply to fresh constructions. Construction failure is returned as-is
    /// without retrying. Dropping the future gives the slot back.
    pub async fn acquire_within(&self, overrides: &SandboxConfig, timeout: Duration) -> Result<SandboxHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.freed.notified();
            tokio::pin!(notified);

            let step = {
                let mut state = self.inner.lock_state();
                if state.shutdown {
                    return Err(CoreError::PoolShutdown);
                }
                // Register before releasing the lock so a release in between is not missed
                notified.as_mut().enable();
                if let Some(entry) = state.idle.pop_front() {
                    state.warm_hits += 1;
                    let reservation = self.inner.reserve(&mut state, Some(Arc::clone(&entry.sandbox)));
                    Step::Reuse(reservation, entry.sandbox)
                } else if state.occupied() < self.inner.config.capacity {
                    state.cold_starts += 1;
                    Step::Create(self.inner.reserve(&mut state, None))
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(reservation, sandbox) => match wake(&sandbox).await {
                    Ok(()) => {
                        tracing::debug!(sandbox_id = %sandbox.id(), "Acquired warm sandbox");
                        return reservation.activate(sandbox).await;
                    }
                    Err(e) => {
                        tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Idle sandbox failed to restart");
                        reservation.discard(sandbox, "restart failed").await;
                    }
                },
                Step::Create(reservation) => {
                    let sandbox = self.inner.construct(overrides).await?;
                    tracing::debug!(sandbox_id = %sandbox.id(), "Acquired new sandbox");
                    return reservation.activate(sandbox).await;
                }
                Step::Wait => {
                    tracing::trace!("Pool at capacity, waiting");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Acquire timed out");
                        return Err(CoreError::PoolTimeout(timeout));
                    }
                }
            }
        }
    }

    /// Return a checked-out sandbox.
    ///
    /// Instances that report `Error`, fail to report, or fail to reset are
    /// destroyed rather than re-queued.
    pub async fn release(&self, sandbox: SandboxHandle) -> Result<()> {
        let id = sandbox.id().clone();
        let reservation = {
            let mut state = self.inner.lock_state();
            if state.active.remove(&id).is_none() {
                tracing::warn!(sandbox_id = %id, "Released sandbox is not checked out from this pool");
                return Err(CoreError::NotFound(id.to_string()));
            }
            self.inner.reserve(&mut state, Some(Arc::clone(&sandbox)))
        };

        match sandbox.info().await {
            Ok(info) if info.state == SandboxState::Error => {
                tracing::info!(sandbox_id = %id, "Released sandbox is in error state, destroying");
                reservation.discard(sandbox, "error state").await;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Released sandbox failed to report, destroying");
                reservation.discard(sandbox, "info failed").await;
                return Ok(());
            }
        }

        if let Err(e) = sandbox.stop().await {
            tracing::warn!(sandbox_id = %id, error = %e, "Reset failed, destroying");
            reservation.discard(sandbox, "reset failed").await;
            return Ok(());
        }

        tracing::debug!(sandbox_id = %id, "Sandbox returned to pool");
        reservation.park(sandbox).await;
        Ok(())
    }

    /// Remove a checked-out sandbox and destroy it.
    pub async fn discard(&self, sandbox: SandboxHandle) -> Result<()> {
        let known = self.inner.lock_state().active.remove(sandbox.id()).is_some();
        if !known {
            tracing::debug!(sandbox_id = %sandbox.id(), "Discarding sandbox not tracked by pool");
        }
        self.inner.destroy(sandbox, "discarded").await;
        Ok(())
    }

    /// Destroy idle instances past the idle timeout. Returns how many.
    pub async fn cleanup(&self) -> Result<usize> {
        Ok(self.inner.cleanup_idle().await)
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        let capacity = self.inner.config.capacity;
        PoolStats {
            total_capacity: capacity,
            available_count: state.idle.len(),
            active_count: state.active.len(),
            pending_count: state.pending,
            created_count: state.created,
            destroyed_count: state.destroyed,
            error_count: state.errors,
            warm_hits: state.warm_hits,
            cold_starts: state.cold_starts,
            average_startup_time: Duration::from_secs_f64(state.avg_startup_secs.unwrap_or(0.0)),
            pool_utilization: state.active.len() as f64 / capacity as f64,
            error_rate: match state.created + state.errors {
                0 => 0.0,
                attempts => state.errors as f64 / attempts as f64,
            },
        }
    }

    /// True once `shutdown` has begun.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock_state().shutdown
    }

    /// Stop maintenance and destroy every instance.
    ///
    /// Waits for the maintenance task to exit before tearing down. Terminal:
    /// later acquisitions fail with [`CoreError::PoolShutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
        }
        tracing::info!("Shutting down sandbox pool");
        self.inner.shutdown_notify.notify_one();
        self.inner.freed.notify_waiters();

        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Maintenance task panicked");
            }
        }

        let sandboxes: Vec<SandboxHandle> = {
            let mut state = self.inner.lock_state();
            let mut all: Vec<_> = state.idle.drain(..).map(|entry| entry.sandbox).collect();
            all.extend(state.active.drain().map(|(_, sandbox)| sandbox));
            all
        };
        let count = sandboxes.len();
        futures::future::join_all(
            sandboxes
                .into_iter()
                .map(|sandbox| self.inner.destroy(sandbox, "pool shutdown")),
        )
        .await;

        tracing::info!(destroyed = count, "Sandbox pool shut down");
        Ok(())
    }
}

impl Drop for SandboxPool {
    fn drop(&mut self) {
        if let Some(handle) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tracing::warn!("SandboxPool dropped without shutdown, aborting maintenance task");
            handle.abort();
        }
    }
}

/// Bring an idle instance back to `Ready`.
async fn wake(sandbox: &SandboxHandle) -> Result<()> {
    let info = sandbox.info().await?;
    match info.state {
        SandboxState::Ready => Ok(()),
        SandboxState::Stopped => sandbox.start().await,
        other => Err(CoreError::InvalidState {
            sandbox_id: sandbox.id().to_string(),
            operation: "acquire",
            expected: SandboxState::Stopped.to_string(),
            actual: other.to_string(),
        }),
    }
}
