//! TaskPool - bounded concurrency with an explicit rejection policy
//!
//! Runs dispatched lanes off the event-receipt path. Concurrency is bounded
//! by a semaphore, submissions beyond the pending-queue capacity are rejected
//! through an observability hook rather than silently dropped, and a panic in
//! a task is contained and logged at the task boundary.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use kb_common::{CoreError, PoolSettings, PoolStats, Result};

/// Called when a submission is rejected; receives the task label.
pub type RejectionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Bounded worker pool for dispatched lanes.
///
/// Tasks waiting for a worker count against the pending-queue capacity; once
/// it is exhausted, further submissions are rejected and the caller decides
/// whether that is user-visible or logged-and-swallowed.
pub struct TaskPool {
    label: String,
    semaphore: Arc<Semaphore>,
    workers: AtomicU32,
    queue_capacity: u32,
    pending: Arc<AtomicU32>,
    active: Arc<AtomicU32>,
    rejected: AtomicU64,
    running: AtomicBool,
    drain_timeout: Duration,
    on_rejection: Option<RejectionHook>,
}

impl TaskPool {
    pub fn new(settings: &PoolSettings) -> Self {
        Self {
            label: settings.label.clone(),
            semaphore: Arc::new(Semaphore::new(settings.workers as usize)),
            workers: AtomicU32::new(settings.workers),
            queue_capacity: settings.queue_capacity,
            pending: Arc::new(AtomicU32::new(0)),
            active: Arc::new(AtomicU32::new(0)),
            rejected: AtomicU64::new(0),
            running: AtomicBool::new(true),
            drain_timeout: settings.drain_timeout(),
            on_rejection: None,
        }
    }

    /// Install the rejection observability hook.
    pub fn with_rejection_hook(mut self, hook: RejectionHook) -> Self {
        self.on_rejection = Some(hook);
        self
    }

    /// Submit a task for execution.
    ///
    /// Returns immediately; the task runs once a worker slot frees up. Fails
    /// with [`CoreError::PoolSaturated`] when the pending queue is full and
    /// with [`CoreError::ShutdownInProgress`] once the pool is draining.
    pub fn submit<F>(&self, task_label: &'static str, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(CoreError::ShutdownInProgress);
        }

        if self.pending.load(Ordering::SeqCst) >= self.queue_capacity {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            metrics::counter!("kudosbot_pool_rejected_total").increment(1);
            warn!(
                pool = %self.label,
                task = task_label,
                pending = self.pending.load(Ordering::SeqCst),
                capacity = self.queue_capacity,
                "Pool saturated, rejecting submission"
            );
            if let Some(hook) = &self.on_rejection {
                hook(task_label);
            }
            return Err(CoreError::PoolSaturated { pool: self.label.clone() });
        }

        self.pending.fetch_add(1, Ordering::SeqCst);

        let semaphore = self.semaphore.clone();
        let pending = self.pending.clone();
        let active = self.active.clone();
        let pool_label = self.label.clone();

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            pending.fetch_sub(1, Ordering::SeqCst);
            active.fetch_add(1, Ordering::SeqCst);

            if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                error!(
                    pool = %pool_label,
                    task = task_label,
                    panic = panic_message(&panic),
                    "Task panicked"
                );
            }

            active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });

        Ok(())
    }

    /// Stop accepting new work; queued and running tasks complete normally.
    pub fn drain(&self) {
        info!(pool = %self.label, "Draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait until all pending and active tasks finish, up to the configured
    /// drain timeout. Returns whether the pool fully drained.
    pub async fn await_drained(&self) -> bool {
        let deadline = Instant::now() + self.drain_timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                warn!(
                    pool = %self.label,
                    pending = self.pending.load(Ordering::SeqCst),
                    active = self.active.load(Ordering::SeqCst),
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Drain timeout reached, abandoning remaining work"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.active.load(Ordering::SeqCst) == 0
    }

    /// Whether the pool still accepts submissions.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply a new worker bound at runtime.
    ///
    /// Added permits take effect immediately; a reduction is reached
    /// gradually as running tasks release their permits.
    pub fn update_workers(&self, new_workers: u32) {
        let old_workers = self.workers.swap(new_workers, Ordering::SeqCst);
        if new_workers == old_workers {
            return;
        }
        if new_workers > old_workers {
            self.semaphore.add_permits((new_workers - old_workers) as usize);
            info!(
                pool = %self.label,
                old = old_workers,
                new = new_workers,
                "Increased pool workers"
            );
        } else {
            // Semaphore permits cannot be revoked; forget them as they drain.
            let excess = (old_workers - new_workers) as usize;
            let semaphore = self.semaphore.clone();
            let label = self.label.clone();
            tokio::spawn(async move {
                for _ in 0..excess {
                    match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
                info!(pool = %label, removed = excess, "Pool worker reduction complete");
            });
            warn!(
                pool = %self.label,
                old = old_workers,
                new = new_workers,
                "Decreasing workers takes effect as running tasks complete"
            );
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            label: self.label.clone(),
            workers: self.workers.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
            queue_capacity: self.queue_capacity,
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
