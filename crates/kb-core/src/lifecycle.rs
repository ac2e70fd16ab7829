//! Lifecycle Manager - background tasks for the resilience core
//!
//! Handles:
//! - Deferred-answer sweep over aged queue items
//! - Periodic status report logging
//! - Graceful shutdown coordination via a broadcast signal
//!
//! The sweep runs with fixed-delay semantics: each pass sleeps for the
//! configured interval after the previous pass finishes, and the interval is
//! re-read from the shared configuration on every iteration so reloads apply
//! without restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use kb_common::HealthStatus;

use crate::dispatcher::EventDispatcher;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for the periodic status report log line.
    pub status_log_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { status_log_interval: Duration::from_secs(60) }
    }
}

/// Owns the background tasks attached to one dispatcher instance.
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Spawn all lifecycle tasks for the given dispatcher.
    pub fn start(dispatcher: Arc<EventDispatcher>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Deferred-answer sweep
        {
            let dispatcher = dispatcher.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    let interval = dispatcher.context().config().queue().sweep_interval();
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            dispatcher.sweep_deferred();
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Deferred-answer sweep shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Status report logger
        {
            let dispatcher = dispatcher.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.status_log_interval;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            let report = dispatcher.context().status();
                            match report.status {
                                HealthStatus::Healthy => {
                                    debug!(queue = %report.queue.summary(), "Status report: healthy");
                                }
                                HealthStatus::Warning => {
                                    warn!(queue = %report.queue.summary(), "Status report: warning");
                                }
                                HealthStatus::Degraded => {
                                    let open: Vec<&str> = report
                                        .circuits
                                        .iter()
                                        .filter(|c| c.state == kb_common::CircuitState::Open)
                                        .map(|c| c.operation.as_str())
                                        .collect();
                                    warn!(
                                        queue = %report.queue.summary(),
                                        open_circuits = ?open,
                                        "Status report: degraded"
                                    );
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Status report logger shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("Lifecycle manager started");
        Self { shutdown_tx }
    }

    /// Signal all lifecycle tasks to stop.
    pub fn shutdown(&self) {
        info!("Lifecycle manager shutting down");
        let _ = self.shutdown_tx.send(());
    }
}
