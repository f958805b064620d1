//! Per-provider circuit breaker.
//!
//! Standard three-state machine: Closed counts call outcomes over a
//! sliding window and opens once the failure rate crosses the configured
//! threshold (with a minimum sample count); Open fails fast until the
//! recovery timer expires; Half-Open admits a bounded number of probe
//! calls, closing on the first probe success and re-opening on a probe
//! failure.

use std::sync::Mutex;

use crate::config::BreakerSettings;
use crate::provider::epoch_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    successes: u32,
    failures: u32,
    window_start: u64,
    opened_at: u64,
    half_open_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerSettings) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                successes: 0,
                failures: 0,
                window_start: epoch_seconds(),
                opened_at: 0,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(epoch_seconds())
    }

    pub fn record_success(&self) {
        self.record_success_at(epoch_seconds());
    }

    pub fn record_failure(&self) {
        self.record_failure_at(epoch_seconds());
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(BreakerState::Closed)
    }

    fn allow_at(&self, now: u64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now >= inner.opened_at.saturating_add(self.config.open_seconds) {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_probes {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success_at(&self, now: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner, now);
                inner.successes += 1;
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.successes = 0;
                inner.failures = 0;
                inner.window_start = now;
                inner.half_open_in_flight = 0;
                tracing::info!("circuit breaker closed after probe success");
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure_at(&self, now: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner, now);
                inner.failures += 1;
                let total = inner.successes + inner.failures;
                if total >= self.config.min_samples {
                    let rate = f64::from(inner.failures) / f64::from(total);
                    if rate >= self.config.failure_rate {
                        inner.state = BreakerState::Open;
                        inner.opened_at = now;
                        tracing::error!(
                            failure_rate = rate,
                            samples = total,
                            "circuit breaker opened"
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = now;
                inner.half_open_in_flight = 0;
                tracing::warn!("circuit breaker re-opened after probe failure");
            }
            BreakerState::Open => {}
        }
    }

    fn roll_window(&self, inner: &mut Inner, now: u64) {
        if now.saturating_sub(inner.window_start) >= self.config.window_seconds {
            inner.successes = 0;
            inner.failures = 0;
            inner.window_start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerSettings {
        BreakerSettings {
            failure_rate: 0.5,
            min_samples: 4,
            window_seconds: 60,
            open_seconds: 30,
            half_open_probes: 2,
        }
    }

    #[test]
    fn closed_allows_and_stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new(config());
        assert!(breaker.allow_at(0));
        breaker.record_success_at(0);
        breaker.record_success_at(0);
        breaker.record_success_at(0);
        breaker.record_failure_at(0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_at_failure_rate_with_min_samples() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure_at(0);
        breaker.record_failure_at(0);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_success_at(0);
        breaker.record_failure_at(0);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_at(10));
    }

    #[test]
    fn half_open_after_timeout_and_closes_on_probe_success() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            breaker.record_failure_at(0);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow_at(30));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success_at(30);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_at(31));
    }

    #[test]
    fn half_open_reopens_on_probe_failure() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            breaker.record_failure_at(0);
        }
        assert!(breaker.allow_at(30));
        breaker.record_failure_at(30);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_at(45));
        assert!(breaker.allow_at(60));
    }

    #[test]
    fn half_open_bounds_probe_count() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            breaker.record_failure_at(0);
        }
        assert!(breaker.allow_at(30));
        assert!(breaker.allow_at(30));
        assert!(!breaker.allow_at(30));
    }

    #[test]
    fn window_roll_discards_stale_outcomes() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure_at(0);
        breaker.record_failure_at(0);
        breaker.record_failure_at(0);
        breaker.record_failure_at(70);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
