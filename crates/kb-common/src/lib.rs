use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ============================================================================
// Core Event Types
// ============================================================================

/// An inbound event as delivered by the chat platform.
///
/// Immutable once received; everything downstream of the dispatcher works on
/// shared references or clones of this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub chat_id: i64,
    pub actor_id: i64,
    /// Platform-side message id, when the event refers to a message.
    pub message_id: Option<i64>,
    pub text: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Classification of an inbound event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Message,
    EditedMessage,
    Reaction,
    Callback,
}

impl EventKind {
    /// Stable lowercase tag used in operation names and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::EditedMessage => "edited_message",
            EventKind::Reaction => "reaction",
            EventKind::Callback => "callback",
        }
    }
}

impl Event {
    pub fn new(kind: EventKind, chat_id: i64, actor_id: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            chat_id,
            actor_id,
            message_id: None,
            text: None,
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey { chat_id: self.chat_id, actor_id: self.actor_id }
    }
}

/// Conversation/actor pair identifying one interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub chat_id: i64,
    pub actor_id: i64,
}

/// A deferred event held in the backpressure queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub event: Event,
    pub session_key: SessionKey,
    pub enqueued_at: Instant,
    /// Whether the originating message still expects an answer when swept.
    pub requires_answer: bool,
}

impl QueueItem {
    pub fn new(event: Event, requires_answer: bool) -> Self {
        let session_key = event.session_key();
        Self { event, session_key, enqueued_at: Instant::now(), requires_answer }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Budget for a single dispatched lane, retry sleeps included.
    pub lane_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { lane_timeout_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Fixed at queue construction; reloads do not resize a live queue.
    pub capacity: usize,
    /// Age after which a queued item is routed to the deferred-answer path.
    pub answer_deadline_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { capacity: 512, answer_deadline_ms: 30_000, sweep_interval_ms: 5_000 }
    }
}

impl QueueSettings {
    pub fn answer_deadline(&self) -> Duration {
        Duration::from_millis(self.answer_deadline_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each computed delay; 0 disables.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive failures while CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// Time an OPEN breaker waits before allowing a probe through.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout_ms: 30_000 }
    }
}

impl CircuitSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Pool label carried in logs, metrics, and stats.
    pub label: String,
    /// Maximum concurrently running tasks.
    pub workers: u32,
    /// Maximum tasks waiting for a worker before submissions are rejected.
    pub queue_capacity: u32,
    pub drain_timeout_ms: u64,
}

impl PoolSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub dispatch: DispatchSettings,
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub general_pool: PoolSettings,
    /// Smaller pool isolating the persistence workload's resource budget.
    pub persist_pool: PoolSettings,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            circuit: CircuitSettings::default(),
            general_pool: PoolSettings {
                label: "general".to_string(),
                workers: 16,
                queue_capacity: 256,
                drain_timeout_ms: 30_000,
            },
            persist_pool: PoolSettings {
                label: "persist".to_string(),
                workers: 4,
                queue_capacity: 64,
                drain_timeout_ms: 30_000,
            },
        }
    }
}

impl DispatchSettings {
    pub fn lane_timeout(&self) -> Duration {
        Duration::from_millis(self.lane_timeout_ms)
    }
}

// ============================================================================
// Status & Report Types
// ============================================================================

/// Circuit breaker state for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, all calls allowed.
    Closed,
    /// Calls rejected until the recovery timeout elapses.
    Open,
    /// Probe calls allowed; next outcome decides the transition.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_open: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub size: usize,
    pub capacity: usize,
    pub utilization_pct: f64,
    pub dropped: u64,
}

impl QueueStatus {
    /// Human-readable one-line summary for logs and operators.
    pub fn summary(&self) -> String {
        format!(
            "queue {}/{} ({:.1}% full), {} dropped",
            self.size, self.capacity, self.utilization_pct, self.dropped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub label: String,
    pub workers: u32,
    pub active: u32,
    pub pending: u32,
    pub queue_capacity: u32,
    pub rejected: u64,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: HealthStatus,
    pub queue: QueueStatus,
    pub circuits: Vec<CircuitSnapshot>,
    pub pools: Vec<PoolStats>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Rejected by the circuit breaker without touching the downstream.
    #[error("circuit open for operation {operation}")]
    CircuitOpen { operation: String },

    /// All retry attempts failed; terminal for this call.
    #[error("retries exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetriesExhausted { operation: String, attempts: u32, last_error: String },

    /// Pool pending queue full and all workers busy.
    #[error("pool {pool} saturated")]
    PoolSaturated { pool: String },

    /// A dispatched lane did not complete within its budget.
    #[error("lane {lane} timed out after {timeout_ms}ms")]
    LaneTimeout { lane: String, timeout_ms: u64 },

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl CoreError {
    /// Cheap policy rejection, as opposed to a genuine downstream failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::CircuitOpen { .. }
                | CoreError::PoolSaturated { .. }
                | CoreError::ShutdownInProgress
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_derived_from_event() {
        let event = Event::new(EventKind::Message, 42, 7);
        assert_eq!(event.session_key(), SessionKey { chat_id: 42, actor_id: 7 });
    }

    #[test]
    fn queue_status_summary_is_readable() {
        let status =
            QueueStatus { size: 3, capacity: 10, utilization_pct: 30.0, dropped: 2 };
        assert_eq!(status.summary(), "queue 3/10 (30.0% full), 2 dropped");
    }

    #[test]
    fn rejection_kinds_are_distinguished() {
        assert!(CoreError::CircuitOpen { operation: "x".into() }.is_rejection());
        assert!(!CoreError::RetriesExhausted {
            operation: "x".into(),
            attempts: 4,
            last_error: "boom".into()
        }
        .is_rejection());
    }
}
