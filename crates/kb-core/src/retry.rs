//! RetryExecutor - bounded retries with exponential backoff
//!
//! Wraps a unit of work and retries transient failures with a growing,
//! jittered delay. The guarded variant checks a circuit breaker before the
//! first attempt and reports exactly one end-to-end outcome to it when the
//! sequence concludes; per-attempt failures are never reported individually.
//!
//! The backoff sleep runs inside the task executing the retry loop, so a
//! retrying lane occupies its pool slot for the whole sequence. Pool sizing
//! must account for the maximum simultaneous in-flight retry sleeps.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use kb_common::{CoreError, Result, RetrySettings};

use crate::circuit::CircuitBreaker;
use crate::context::ConfigHandle;

/// Executes work with bounded retries; cheap to clone.
///
/// Retry settings are read from the shared configuration at the start of each
/// run, so reloads apply to the next call.
#[derive(Clone)]
pub struct RetryExecutor {
    config: ConfigHandle,
}

impl RetryExecutor {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    /// Run `work`, retrying failures until it succeeds or attempts run out.
    ///
    /// With `max_retries = N` the work function is invoked at most `N + 1`
    /// times. On exhaustion the last error is wrapped in
    /// [`CoreError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut work: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let settings = self.config.retry();
        let max_attempts = settings.max_retries + 1;
        let mut delay = settings.initial_delay();
        let mut attempt = 1u32;

        loop {
            match work().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation, attempt = attempt, "Recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!(
                            operation = operation,
                            attempts = attempt,
                            error = %error,
                            "Retries exhausted"
                        );
                        return Err(CoreError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: error.to_string(),
                        });
                    }

                    let sleep_for = apply_jitter(delay, settings.jitter_factor);
                    debug!(
                        operation = operation,
                        attempt = attempt,
                        delay_ms = sleep_for.as_millis() as u64,
                        error = %error,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(sleep_for).await;

                    delay = next_delay(delay, &settings);
                    attempt += 1;
                }
            }
        }
    }

    /// Run `work` behind a circuit breaker.
    ///
    /// When the breaker is open the work function is not invoked at all and
    /// no retries are consumed; the call fails immediately with
    /// [`CoreError::CircuitOpen`]. Otherwise the full retry sequence runs and
    /// its final outcome is reported to the breaker exactly once.
    pub async fn run_guarded<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        operation: &str,
        work: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !breaker.is_allowed(operation) {
            debug!(operation = operation, "Circuit open, rejecting without attempt");
            return Err(CoreError::CircuitOpen { operation: operation.to_string() });
        }

        match self.run(operation, work).await {
            Ok(value) => {
                breaker.record_success(operation);
                Ok(value)
            }
            Err(error) => {
                if let CoreError::RetriesExhausted { last_error, .. } = &error {
                    breaker.record_failure(operation, last_error);
                }
                Err(error)
            }
        }
    }
}

fn next_delay(current: Duration, settings: &RetrySettings) -> Duration {
    let grown = current.mul_f64(settings.backoff_multiplier.max(1.0));
    grown.min(settings.max_delay())
}

/// Randomize a delay by up to the configured fraction in either direction,
/// spreading out retries from lanes that failed at the same moment.
fn apply_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return delay;
    }
    let factor = jitter_factor.clamp(0.0, 1.0);
    let range = delay.as_secs_f64() * factor;
    let offset = rand::thread_rng().gen_range(-range..=range);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_common::{CircuitSettings, CoreConfig, RetrySettings};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(max_retries: u32) -> ConfigHandle {
        ConfigHandle::new(CoreConfig {
            retry: RetrySettings {
                max_retries,
                initial_delay_ms: 1,
                backoff_multiplier: 2.0,
                max_delay_ms: 10,
                jitter_factor: 0.0,
            },
            circuit: CircuitSettings { failure_threshold: 2, recovery_timeout_ms: 60_000 },
            ..CoreConfig::default()
        })
    }

    #[tokio::test]
    async fn success_on_first_attempt_invokes_once() {
        let executor = RetryExecutor::new(config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result = executor
            .run("op", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn always_failing_work_runs_max_retries_plus_one_times() {
        let executor = RetryExecutor::new(config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result: Result<()> = executor
            .run("op", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("always fails")
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(CoreError::RetriesExhausted { attempts, operation, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(operation, "op");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let executor = RetryExecutor::new(config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result = executor
            .run("op", move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient")
                    }
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_invoking_work() {
        let handle = config(3);
        let executor = RetryExecutor::new(handle.clone());
        let breaker = CircuitBreaker::new(handle);
        breaker.record_failure("op", "down");
        breaker.record_failure("op", "down");
        assert!(!breaker.is_allowed("op"));

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<()> = executor
            .run_guarded(&breaker, "op", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(CoreError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn breaker_sees_one_outcome_per_retry_sequence() {
        let handle = config(2);
        let executor = RetryExecutor::new(handle.clone());
        let breaker = CircuitBreaker::new(handle);

        // A full exhausted sequence (3 attempts) counts as one failure.
        let result: Result<()> = executor
            .run_guarded(&breaker, "op", || async { anyhow::bail!("down") })
            .await;
        assert!(matches!(result, Err(CoreError::RetriesExhausted { .. })));
        assert_eq!(breaker.snapshot()[0].consecutive_failures, 1);

        // A second exhausted sequence reaches the threshold of 2 and opens.
        let _: Result<()> =
            executor.run_guarded(&breaker, "op", || async { anyhow::bail!("down") }).await;
        assert!(!breaker.is_allowed("op"));
    }

    #[tokio::test]
    async fn breaker_reset_between_sequences_ends_closed() {
        let handle = config(0);
        let executor = RetryExecutor::new(handle.clone());
        let breaker = CircuitBreaker::new(handle.clone());
        {
            // Tighten the threshold so three failures open the breaker.
            let mut cfg = handle.snapshot();
            cfg.circuit.failure_threshold = 3;
            handle.replace(cfg);
        }

        for _ in 0..3 {
            let _: Result<()> =
                executor.run_guarded(&breaker, "op", || async { anyhow::bail!("down") }).await;
        }
        assert!(!breaker.is_allowed("op"));

        breaker.reset("op");
        let result = executor
            .run_guarded(&breaker, "op", || async { Ok::<_, anyhow::Error>(1) })
            .await;
        assert_eq!(result.unwrap(), 1);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot[0].state, kb_common::CircuitState::Closed);
        assert_eq!(snapshot[0].consecutive_failures, 0);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let settings = RetrySettings {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 300,
            jitter_factor: 0.0,
        };
        let d1 = next_delay(Duration::from_millis(100), &settings);
        let d2 = next_delay(d1, &settings);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered <= Duration::from_millis(150));
        }
    }
}
