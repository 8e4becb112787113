//! Backoff and circuit-breaker helpers shared by the carrier, realtime, and
//! ticketing HTTP clients.
//!
//! The jittered-exponential formula is the same shape the teacher's
//! `try_assign_queued_calls_to_agent` uses for requeue backoff
//! (`base * 2^(n-1)`, capped), generalized here into a reusable function
//! instead of being inlined at each call site.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter, capped at `max`.
pub fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(max.as_millis());
    let jitter = rand::thread_rng().gen_range(0..=capped.max(1));
    Duration::from_millis(jitter as u64)
}

/// Accept-handshake backoff per spec §4.3 step 5: initial 200ms, cap 3s,
/// jitter <= 100ms on top of the exponential value.
pub fn accept_retry_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(200);
    let cap = Duration::from_secs(3);
    let exp_ms = (base.as_millis() as u64).saturating_mul(1u64 << attempt.min(16));
    let capped_ms = exp_ms.min(cap.as_millis() as u64);
    let jitter_ms = rand::thread_rng().gen_range(0..=100u64);
    Duration::from_millis(capped_ms + jitter_ms)
}

/// DB retry wrapper bounds, per spec §5: 2 retries, 250ms base, 1s cap, jitter.
pub fn db_retry_delay(attempt: u32) -> Duration {
    backoff_with_jitter(attempt, Duration::from_millis(250), Duration::from_secs(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-dependency circuit breaker: opens after `failure_threshold` consecutive
/// failures, half-opens for one probe after `cooldown`.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at: parking_lot::Mutex<Option<std::time::Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            failure_threshold,
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            opened_at: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        let opened_at = *self.opened_at.lock();
        match opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    pub fn allow(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.opened_at.lock() = None;
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            let mut opened_at = self.opened_at.lock();
            if opened_at.is_none() {
                *opened_at = Some(std::time::Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_retry_delay_respects_cap() {
        for attempt in 0..10 {
            let d = accept_retry_delay(attempt);
            assert!(d <= Duration::from_millis(3100));
        }
    }

    #[test]
    fn circuit_opens_after_threshold_and_half_opens_after_cooldown() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(10));
        assert!(cb.allow());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
