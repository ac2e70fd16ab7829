//! Circuit breaker - per-operation guard against a degrading downstream
//!
//! Tracks consecutive failures per operation name and stops calling a failing
//! dependency for a cooldown period instead of amplifying the failure.
//!
//! State machine per operation:
//! - CLOSED (initial): all calls allowed; failures increment a counter, and
//!   reaching the threshold opens the breaker.
//! - OPEN: all calls rejected until the recovery timeout elapses; the next
//!   allowance check after the boundary flips to HALF_OPEN and lets the call
//!   through as a probe.
//! - HALF_OPEN: a probe success closes the breaker and zeroes the counter; a
//!   probe failure re-opens it with a fresh timestamp.
//!
//! There is no single-flight guarantee on probes: concurrent callers near the
//! recovery boundary may all be allowed through, and their outcomes apply in
//! arrival order. The cost of an extra probe is accepted.

use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use kb_common::{CircuitSnapshot, CircuitState};

use crate::context::ConfigHandle;

/// Per-operation breaker record. Created lazily on first use, never removed.
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
    }
}

/// Thread-safe circuit breaker keyed by operation name.
///
/// Records live in a sharded map so unrelated operations never contend on a
/// common lock. Threshold and recovery timeout are read from the shared
/// configuration at every evaluation, so reloads apply to the next call.
pub struct CircuitBreaker {
    config: ConfigHandle,
    records: DashMap<String, CircuitRecord>,
}

impl CircuitBreaker {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config, records: DashMap::new() }
    }

    /// Whether a call for `operation` may proceed right now.
    ///
    /// Does not touch failure counters, but performs the OPEN to HALF_OPEN
    /// transition once the recovery timeout has elapsed.
    pub fn is_allowed(&self, operation: &str) -> bool {
        let recovery_timeout = self.config.circuit().recovery_timeout();
        let mut record = self.records.entry(operation.to_string()).or_default();

        match record.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = record.opened_at.map(|t| t.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= recovery_timeout => {
                        info!(
                            operation = operation,
                            open_for_ms = elapsed.as_millis() as u64,
                            "Circuit transitioning to half-open, allowing probe"
                        );
                        record.state = CircuitState::HalfOpen;
                        true
                    }
                    Some(_) => false,
                    // Open without a timestamp cannot recover on its own.
                    None => false,
                }
            }
        }
    }

    /// Record a successful call outcome for `operation`.
    pub fn record_success(&self, operation: &str) {
        let mut record = self.records.entry(operation.to_string()).or_default();
        record.consecutive_failures = 0;

        match record.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                // Probes race near the recovery boundary; a late success for
                // a re-opened circuit is logged and otherwise ignored.
                debug!(operation = operation, "Success recorded while circuit open");
            }
            CircuitState::HalfOpen => {
                info!(operation = operation, "Probe succeeded, closing circuit");
                record.state = CircuitState::Closed;
                record.opened_at = None;
            }
        }
    }

    /// Record a failed call outcome for `operation`.
    pub fn record_failure(&self, operation: &str, cause: &str) {
        let threshold = self.config.circuit().failure_threshold;
        let mut record = self.records.entry(operation.to_string()).or_default();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);

        match record.state {
            CircuitState::Closed => {
                if record.consecutive_failures >= threshold {
                    Self::open(operation, &mut record, cause);
                }
            }
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                Self::open(operation, &mut record, cause);
            }
        }
    }

    /// Force an operation back to CLOSED with a zero counter.
    ///
    /// Administrative escape hatch; normal recovery goes through HALF_OPEN.
    pub fn reset(&self, operation: &str) {
        let mut record = self.records.entry(operation.to_string()).or_default();
        record.state = CircuitState::Closed;
        record.consecutive_failures = 0;
        record.opened_at = None;
        info!(operation = operation, "Circuit reset to closed");
    }

    /// Current state of one operation, if it has ever been used.
    pub fn state(&self, operation: &str) -> Option<CircuitState> {
        self.records.get(operation).map(|r| r.state)
    }

    /// Snapshot of every known operation, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .records
            .iter()
            .map(|entry| CircuitSnapshot {
                operation: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                seconds_since_open: entry.opened_at.map(|t| t.elapsed().as_secs()),
            })
            .collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }

    /// Whether any operation is currently open.
    pub fn any_open(&self) -> bool {
        self.records.iter().any(|r| r.state == CircuitState::Open)
    }

    fn open(operation: &str, record: &mut CircuitRecord, cause: &str) {
        warn!(
            operation = operation,
            consecutive_failures = record.consecutive_failures,
            cause = cause,
            "Circuit opening"
        );
        metrics::counter!("kudosbot_circuit_opened_total").increment(1);
        record.state = CircuitState::Open;
        record.opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_common::{CircuitSettings, CoreConfig};
    use std::time::Duration;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        let config = CoreConfig {
            circuit: CircuitSettings {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
            },
            ..CoreConfig::default()
        };
        CircuitBreaker::new(ConfigHandle::new(config))
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let breaker = breaker(3, 100);
        assert!(breaker.is_allowed("score"));
        assert_eq!(breaker.state("score"), Some(CircuitState::Closed));
    }

    #[test]
    fn opens_at_exactly_the_failure_threshold() {
        let breaker = breaker(3, 60_000);

        breaker.record_failure("score", "db down");
        breaker.record_failure("score", "db down");
        assert_eq!(breaker.state("score"), Some(CircuitState::Closed));
        assert!(breaker.is_allowed("score"));

        breaker.record_failure("score", "db down");
        assert_eq!(breaker.state("score"), Some(CircuitState::Open));
        assert!(!breaker.is_allowed("score"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = breaker(3, 60_000);

        breaker.record_failure("score", "timeout");
        breaker.record_failure("score", "timeout");
        breaker.record_success("score");
        breaker.record_failure("score", "timeout");
        breaker.record_failure("score", "timeout");

        // Two fresh failures after the reset: still closed.
        assert_eq!(breaker.state("score"), Some(CircuitState::Closed));
    }

    #[test]
    fn open_rejects_until_recovery_timeout_then_probes() {
        let breaker = breaker(1, 30);
        breaker.record_failure("llm", "503");
        assert!(!breaker.is_allowed("llm"));

        std::thread::sleep(Duration::from_millis(40));

        // First check at/after the boundary flips to half-open and passes.
        assert!(breaker.is_allowed("llm"));
        assert_eq!(breaker.state("llm"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn half_open_success_closes_and_zeroes_counter() {
        let breaker = breaker(1, 10);
        breaker.record_failure("llm", "503");
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.is_allowed("llm"));

        breaker.record_success("llm");
        assert_eq!(breaker.state("llm"), Some(CircuitState::Closed));
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot[0].consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timestamp() {
        let breaker = breaker(1, 10);
        breaker.record_failure("llm", "503");
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.is_allowed("llm"));

        breaker.record_failure("llm", "still down");
        assert_eq!(breaker.state("llm"), Some(CircuitState::Open));
        assert!(!breaker.is_allowed("llm"));
    }

    #[test]
    fn is_allowed_does_not_touch_counters() {
        let breaker = breaker(3, 60_000);
        breaker.record_failure("score", "x");

        for _ in 0..10 {
            assert!(breaker.is_allowed("score"));
        }
        assert_eq!(breaker.snapshot()[0].consecutive_failures, 1);
    }

    #[test]
    fn reset_forces_closed() {
        let breaker = breaker(1, 60_000);
        breaker.record_failure("store", "disk full");
        assert!(!breaker.is_allowed("store"));

        breaker.reset("store");
        assert!(breaker.is_allowed("store"));
        assert_eq!(breaker.snapshot()[0].consecutive_failures, 0);
    }

    #[test]
    fn operations_are_independent() {
        let breaker = breaker(1, 60_000);
        breaker.record_failure("store", "disk full");

        assert!(!breaker.is_allowed("store"));
        assert!(breaker.is_allowed("score"));
        assert!(breaker.any_open());
    }
}
