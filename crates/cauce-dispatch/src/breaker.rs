// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker around the agent runtime.
//!
//! Opens after a run of consecutive failures; after the recovery window a
//! single half-open probe is allowed through. The probe's outcome closes
//! the circuit or re-opens it.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use cauce_core::CauceError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery: Duration,
    inner: StdMutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Defaults per the dispatch design: open after 5 consecutive errors,
    /// half-open probe after 30 s.
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            failure_threshold,
            recovery,
            inner: StdMutex::new(BreakerInner {
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask permission to call through the breaker.
    pub fn try_acquire(&self) -> Result<(), CauceError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.status {
            BreakerStatus::Closed => Ok(()),
            BreakerStatus::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery {
                    inner.status = BreakerStatus::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CauceError::CircuitOpen)
                }
            }
            BreakerStatus::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CauceError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.status = BreakerStatus::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Report a failed call.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;

        let should_open = inner.status == BreakerStatus::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if should_open && inner.status != BreakerStatus::Open {
            inner.status = BreakerStatus::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    /// Whether the breaker currently rejects calls.
    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("breaker lock poisoned").status == BreakerStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.on_failure();
        }
        assert!(breaker.try_acquire().is_ok());

        breaker.on_failure();
        assert!(breaker.is_open());
        assert!(matches!(
            breaker.try_acquire(),
            Err(CauceError::CircuitOpen)
        ));
    }

    #[test]
    fn success_resets_failure_run() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.on_failure();
        }
        breaker.on_success();
        for _ in 0..4 {
            breaker.on_failure();
        }
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_open_allows_single_probe() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(20));

        // First acquire is the probe; a second concurrent one is rejected.
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());

        breaker.on_success();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.on_failure();
        breaker.on_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.try_acquire().is_ok());
        breaker.on_failure();
        assert!(breaker.is_open());
        assert!(breaker.try_acquire().is_err());
    }
}
