//! Per-identifier token buckets with greedy refill.
//!
//! Each bucket holds `requests_per_minute` tokens and refills continuously
//! at that rate, accumulating up to capacity. Consume-and-snapshot is
//! atomic under one lock, so the headers a caller sees always reflect the
//! decrement that admitted their request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::RateLimitSettings;
use crate::metrics::Metrics;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_millis: u64,
}

pub struct RateLimiter {
    enabled: bool,
    capacity: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Box<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings, metrics: Arc<Metrics>) -> Self {
        Self::with_clock(settings, Box::new(SystemClock), metrics)
    }

    pub fn with_clock(
        settings: &RateLimitSettings,
        clock: Box<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        if settings.enabled {
            tracing::info!(
                requests_per_minute = settings.requests_per_minute,
                "rate limiting enabled"
            );
        }
        Self {
            enabled: settings.enabled,
            capacity: settings.requests_per_minute.max(1),
            buckets: Mutex::new(HashMap::new()),
            clock,
            metrics,
        }
    }

    /// Consume one token for the identifier. On success the returned
    /// snapshot is taken immediately after the decrement; on rejection the
    /// snapshot reflects the untouched bucket.
    pub fn try_consume(&self, identifier: &str) -> (bool, RateLimitStatus) {
        if !self.enabled {
            return (true, self.unlimited());
        }

        let now = self.clock.now_millis();
        let Ok(mut buckets) = self.buckets.lock() else {
            return (true, self.unlimited());
        };
        let bucket = buckets.entry(identifier.to_string()).or_insert(Bucket {
            tokens: f64::from(self.capacity),
            last_refill_millis: now,
        });
        self.refill(bucket, now);

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        } else {
            tracing::warn!(identifier, "rate limit exceeded");
            self.metrics.record_rate_limited();
        }
        (allowed, self.snapshot(bucket))
    }

    /// Current state without consuming. Unknown identifiers report a full
    /// bucket; no entry is created.
    pub fn status(&self, identifier: &str) -> RateLimitStatus {
        if !self.enabled {
            return self.unlimited();
        }
        let now = self.clock.now_millis();
        let Ok(mut buckets) = self.buckets.lock() else {
            return self.unlimited();
        };
        match buckets.get_mut(identifier) {
            Some(bucket) => {
                self.refill(bucket, now);
                self.snapshot(bucket)
            }
            None => RateLimitStatus {
                limit: self.capacity,
                remaining: self.capacity,
                reset_seconds: 0,
            },
        }
    }

    /// Admin reset: the next request from this identifier sees a full
    /// bucket again.
    pub fn reset(&self, identifier: &str) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.remove(identifier);
        }
        tracing::info!(identifier, "rate limit reset");
    }

    fn refill(&self, bucket: &mut Bucket, now: u64) {
        let elapsed_ms = now.saturating_sub(bucket.last_refill_millis);
        if elapsed_ms == 0 {
            return;
        }
        let refill = elapsed_ms as f64 * f64::from(self.capacity) / 60_000.0;
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.capacity));
        bucket.last_refill_millis = now;
    }

    fn snapshot(&self, bucket: &Bucket) -> RateLimitStatus {
        let remaining = bucket.tokens.floor().max(0.0) as u32;
        let missing = f64::from(self.capacity) - bucket.tokens;
        let reset_seconds = if missing <= 0.0 {
            0
        } else {
            (missing * 60.0 / f64::from(self.capacity)).ceil() as u64
        };
        RateLimitStatus {
            limit: self.capacity,
            remaining: remaining.min(self.capacity),
            reset_seconds,
        }
    }

    fn unlimited(&self) -> RateLimitStatus {
        RateLimitStatus {
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_seconds: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualClock(Arc<AtomicU64>);

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn limiter(capacity: u32) -> (RateLimiter, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(0));
        let settings = RateLimitSettings {
            enabled: true,
            requests_per_minute: capacity,
            tokens_per_minute: 100_000,
        };
        let limiter = RateLimiter::with_clock(
            &settings,
            Box::new(ManualClock(now.clone())),
            Arc::new(Metrics::new()),
        );
        (limiter, now)
    }

    #[test]
    fn snapshot_reflects_decrement_immediately() {
        let (limiter, _) = limiter(60);
        let (allowed, status) = limiter.try_consume("caller");
        assert!(allowed);
        assert_eq!(status.limit, 60);
        assert_eq!(status.remaining, 59);
    }

    #[test]
    fn sixty_first_request_within_a_second_is_rejected() {
        let (limiter, now) = limiter(60);
        for i in 0..60 {
            now.store(i * 10, Ordering::SeqCst);
            let (allowed, _) = limiter.try_consume("caller");
            assert!(allowed, "request {i} should pass");
        }
        now.store(600, Ordering::SeqCst);
        let (allowed, status) = limiter.try_consume("caller");
        assert!(!allowed);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn greedy_refill_restores_one_token_per_interval() {
        let (limiter, now) = limiter(60);
        for _ in 0..60 {
            let (allowed, _) = limiter.try_consume("caller");
            assert!(allowed);
        }
        let (allowed, _) = limiter.try_consume("caller");
        assert!(!allowed);

        // One token refills every 1000 ms at 60 rpm.
        now.store(1000, Ordering::SeqCst);
        let (allowed, status) = limiter.try_consume("caller");
        assert!(allowed);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn idle_minute_refills_to_capacity() {
        let (limiter, now) = limiter(2);
        assert!(limiter.try_consume("caller").0);
        assert!(limiter.try_consume("caller").0);
        assert!(!limiter.try_consume("caller").0);

        now.store(60_000, Ordering::SeqCst);
        let status = limiter.status("caller");
        assert_eq!(status.remaining, 2);
        assert_eq!(status.reset_seconds, 0);
    }

    #[test]
    fn remaining_never_exceeds_limit() {
        let (limiter, now) = limiter(10);
        limiter.try_consume("caller");
        now.store(3_600_000, Ordering::SeqCst);
        let status = limiter.status("caller");
        assert!(status.remaining <= status.limit);
        assert_eq!(status.remaining, 10);
    }

    #[test]
    fn buckets_are_per_identifier() {
        let (limiter, _) = limiter(1);
        assert!(limiter.try_consume("a").0);
        assert!(!limiter.try_consume("a").0);
        assert!(limiter.try_consume("b").0);
    }

    #[test]
    fn reset_restores_full_bucket() {
        let (limiter, _) = limiter(1);
        assert!(limiter.try_consume("caller").0);
        assert!(!limiter.try_consume("caller").0);
        limiter.reset("caller");
        assert!(limiter.try_consume("caller").0);
    }

    #[test]
    fn unknown_identifier_status_is_full_without_creating_a_bucket() {
        let (limiter, _) = limiter(5);
        let status = limiter.status("never-seen");
        assert_eq!(status.remaining, 5);
        assert_eq!(status.reset_seconds, 0);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let settings = RateLimitSettings {
            enabled: false,
            requests_per_minute: 1,
            tokens_per_minute: 100_000,
        };
        let limiter = RateLimiter::new(&settings, Arc::new(Metrics::new()));
        for _ in 0..10 {
            let (allowed, status) = limiter.try_consume("caller");
            assert!(allowed);
            assert_eq!(status.limit, u32::MAX);
        }
    }

    #[test]
    fn reset_seconds_tracks_time_to_full() {
        let (limiter, _) = limiter(60);
        let (_, status) = limiter.try_consume("caller");
        assert_eq!(status.reset_seconds, 1);
    }
}
