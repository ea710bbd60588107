//! Per-client-IP token bucket rate limiter.
//!
//! Mirrors `vantage-collector/app/middleware/rate_limiter.py`:
//! one bucket per IP, lazily created, refilled lazily on access rather than
//! on a timer. Buckets untouched for `2 * window` are evicted by a periodic
//! sweep to bound memory.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig { max_requests: 1000, window_seconds: 60 }
    }
}

impl RateLimiterConfig {
    fn refill_rate_per_sec(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds as f64
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Paths that bypass the limiter entirely.
pub fn is_exempt_path(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/live" | "/metrics")
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, Bucket>,
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        RateLimiter { config, buckets: DashMap::new() }
    }

    /// Attempts to consume one token for `client_key` (typically the peer
    /// IP). Refills lazily based on elapsed time since the last touch.
    pub fn check(&self, client_key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let refill_rate = self.config.refill_rate_per_sec();
        let max_tokens = self.config.max_requests as f64;

        let mut bucket = self
            .buckets
            .entry(client_key.to_string())
            .or_insert_with(|| Bucket { tokens: max_tokens, last_refill: now });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision { allowed: true, retry_after_secs: 0 }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after = (deficit / refill_rate).ceil().max(1.0) as u64;
            RateLimitDecision { allowed: false, retry_after_secs: retry_after }
        }
    }

    /// Evicts buckets untouched for `2 * window_seconds`. Call periodically
    /// from a background tick.
    pub fn evict_stale(&self) {
        let cutoff = Duration::from_secs(self.config.window_seconds * 2);
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < cutoff);
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new(RateLimiterConfig { max_requests: 5, window_seconds: 60 });
        for _ in 0..5 {
            assert!(limiter.check("1.2.3.4").allowed);
        }
        let decision = limiter.check("1.2.3.4");
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs >= 1);
    }

    #[test]
    fn separate_clients_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimiterConfig { max_requests: 1, window_seconds: 60 });
        assert!(limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert!(!limiter.check("a").allowed);
    }

    #[test]
    fn exempt_paths_bypass() {
        assert!(is_exempt_path("/health"));
        assert!(is_exempt_path("/metrics"));
        assert!(!is_exempt_path("/v1/metrics"));
    }

    #[test]
    fn eviction_removes_stale_buckets() {
        let limiter = RateLimiter::new(RateLimiterConfig { max_requests: 5, window_seconds: 0 });
        limiter.check("stale");
        std::thread::sleep(Duration::from_millis(5));
        limiter.evict_stale();
        assert_eq!(limiter.bucket_count(), 0);
    }
}
