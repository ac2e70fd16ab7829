//! CoreContext - explicitly constructed shared state
//!
//! The queue, circuit-record map, pools, and exclusive-session slot are
//! shared by every concurrent lane. They live in one context object with a
//! clear construction/teardown lifecycle instead of process-wide statics, so
//! tests get isolation and multiple independent instances can coexist.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use kb_common::{
    CircuitSettings, CoreConfig, DispatchSettings, HealthStatus, QueueSettings,
    RetrySettings, StatusReport,
};

use crate::circuit::CircuitBreaker;
use crate::pool::TaskPool;
use crate::queue::BackpressureQueue;
use crate::session::ExclusiveSessionGate;

/// Shared, hot-reloadable configuration handle.
///
/// Components keep a clone and read the values they need at use time rather
/// than caching them at construction, so a reload applies to the next call.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<CoreConfig>>,
}

impl ConfigHandle {
    pub fn new(config: CoreConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(config)) }
    }

    pub fn snapshot(&self) -> CoreConfig {
        self.inner.read().clone()
    }

    pub fn dispatch(&self) -> DispatchSettings {
        self.inner.read().dispatch.clone()
    }

    pub fn queue(&self) -> QueueSettings {
        self.inner.read().queue.clone()
    }

    pub fn retry(&self) -> RetrySettings {
        self.inner.read().retry.clone()
    }

    pub fn circuit(&self) -> CircuitSettings {
        self.inner.read().circuit.clone()
    }

    pub fn replace(&self, config: CoreConfig) {
        *self.inner.write() = config;
    }
}

/// Owns the shared resilience state for one dispatcher instance.
pub struct CoreContext {
    config: ConfigHandle,
    pub queue: Arc<BackpressureQueue>,
    pub breaker: Arc<CircuitBreaker>,
    pub general_pool: Arc<TaskPool>,
    pub persist_pool: Arc<TaskPool>,
    pub session_gate: Arc<ExclusiveSessionGate>,
}

impl CoreContext {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        let handle = ConfigHandle::new(config.clone());
        Arc::new(Self {
            queue: Arc::new(BackpressureQueue::new(config.queue.capacity)),
            breaker: Arc::new(CircuitBreaker::new(handle.clone())),
            general_pool: Arc::new(TaskPool::new(&config.general_pool)),
            persist_pool: Arc::new(TaskPool::new(&config.persist_pool)),
            session_gate: Arc::new(ExclusiveSessionGate::new()),
            config: handle,
        })
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Apply a new configuration without restart.
    ///
    /// Retry, circuit, and lane-timeout settings take effect on the next
    /// call; pool worker bounds are adjusted in place. The queue capacity is
    /// fixed at construction, so a change there is only logged.
    pub fn reload(&self, config: CoreConfig) {
        if config.queue.capacity != self.queue.capacity() {
            warn!(
                current = self.queue.capacity(),
                requested = config.queue.capacity,
                "Queue capacity is fixed at construction; change requires restart"
            );
        }
        self.general_pool.update_workers(config.general_pool.workers);
        self.persist_pool.update_workers(config.persist_pool.workers);
        self.config.replace(config);
        info!("Configuration reloaded");
    }

    /// Assemble the on-demand status report for operators.
    pub fn status(&self) -> StatusReport {
        let queue = self.queue.status();
        let circuits = self.breaker.snapshot();
        let pools = vec![self.general_pool.stats(), self.persist_pool.stats()];

        let status = if self.breaker.any_open() {
            HealthStatus::Degraded
        } else if queue.utilization_pct >= 90.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        StatusReport { status, queue, circuits, pools }
    }

    /// Stop intake on both pools and wait for in-flight lanes to finish,
    /// bounded by each pool's drain timeout.
    pub async fn shutdown(&self) {
        info!("Core context shutting down");
        self.general_pool.drain();
        self.persist_pool.drain();

        let general_drained = self.general_pool.await_drained().await;
        let persist_drained = self.persist_pool.await_drained().await;
        if general_drained && persist_drained {
            info!("Core context shutdown complete");
        } else {
            warn!(
                general_drained = general_drained,
                persist_drained = persist_drained,
                "Core context shutdown with abandoned work"
            );
        }
    }
}
