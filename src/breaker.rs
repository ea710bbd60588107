//! Circuit breaker wrapping the log-bus producer.
//!
//! Three states, mirroring `vantage_common/circuit_breaker.py`:
//! closed → open on
//! `failure_threshold` consecutive failures; open rejects immediately and
//! moves to half-open after `timeout`; half-open admits a bounded number of
//! trial calls and closes after `success_threshold` consecutive successes,
//! or re-opens on the first failure.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::now_ms;
use crate::error::CircuitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Lock-free state transitions: a single atomic state tag plus atomic
/// counters. Reads never block.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    half_open_calls: AtomicU32,
    last_failure_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Must be called before attempting the guarded operation. Returns
    /// `Err(CircuitError::Open)` with no I/O when the circuit is open and the
    /// timeout hasn't elapsed.
    pub fn before_call(&self) -> Result<(), CircuitError> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = now_ms() - self.last_failure_ms.load(Ordering::Acquire);
                if elapsed >= self.config.timeout.as_millis() as i64 {
                    self.transition_to_half_open();
                    self.admit_half_open_call()
                } else {
                    let retry_after = ((self.config.timeout.as_millis() as i64 - elapsed).max(0)
                        / 1000) as u64
                        + 1;
                    Err(CircuitError::Open { retry_after_secs: retry_after })
                }
            }
            CircuitState::HalfOpen => self.admit_half_open_call(),
        }
    }

    fn admit_half_open_call(&self) -> Result<(), CircuitError> {
        let calls = self.half_open_calls.fetch_add(1, Ordering::AcqRel);
        if calls >= self.config.half_open_max_calls {
            self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
            Err(CircuitError::Open { retry_after_secs: 1 })
        } else {
            Ok(())
        }
    }

    pub fn on_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition_to_closed();
            }
        }
    }

    pub fn on_failure(&self) {
        self.last_failure_ms.store(now_ms(), Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            self.transition_to_open();
            return;
        }
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            self.transition_to_open();
        }
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        warn!(event = "circuit_opened", component = "breaker", "circuit breaker opened");
    }

    fn transition_to_half_open(&self) {
        // Best-effort CAS: if another task already flipped it, fine either way.
        let _ = self.state.compare_exchange(
            CircuitState::Open as u8,
            CircuitState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.half_open_calls.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        info!(event = "circuit_half_open", component = "breaker", "circuit breaker half-open, testing recovery");
    }

    fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        info!(event = "circuit_closed", component = "breaker", "circuit breaker closed, service recovered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker();
        for _ in 0..3 {
            assert!(b.before_call().is_ok());
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.before_call().is_err());
    }

    #[test]
    fn success_resets_failure_count_in_closed_state() {
        let b = breaker();
        b.before_call().unwrap();
        b.on_failure();
        b.before_call().unwrap();
        b.on_success();
        b.before_call().unwrap();
        b.on_failure();
        // Only one consecutive failure since the reset; shouldn't be open yet.
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_then_closes_on_successes() {
        let b = breaker();
        for _ in 0..3 {
            b.before_call().unwrap();
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.before_call().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.on_success();
        assert!(b.before_call().is_ok());
        b.on_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.before_call().unwrap();
            b.on_failure();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.before_call().is_ok());
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
