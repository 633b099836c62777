//! Ingest Rate Limiter
//! ===================
//! In-process token bucket per agent token digest. Capacity 30, refilling
//! at 30 per 60 s; buckets idle for more than 600 s are reaped.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Token bucket for a single agent.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    /// tokens per second
    refill_rate: f64,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        TokenBucket {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Refill from elapsed wall-clock time, cap at capacity, then consume
    /// one token if available.
    fn consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-agent rate limiter keyed by token digest.
pub struct IngestRateLimiter {
    buckets: DashMap<String, TokenBucket>,
    max_tokens: f64,
    refill_rate: f64,
}

impl IngestRateLimiter {
    /// `max_requests` spread over `window_seconds`.
    pub fn new(max_requests: u32, window_seconds: u32) -> Self {
        IngestRateLimiter {
            buckets: DashMap::new(),
            max_tokens: max_requests as f64,
            refill_rate: max_requests as f64 / window_seconds as f64,
        }
    }

    /// True if the request is allowed, false if rate-limited.
    pub fn check(&self, token_digest: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(token_digest.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens, self.refill_rate));
        bucket.consume()
    }

    /// Reap buckets idle longer than `max_idle`. Returns count removed.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() <= max_idle);
        before - self.buckets.len()
    }
}

impl Default for IngestRateLimiter {
    /// The production configuration: 30 requests per 60 seconds per agent.
    fn default() -> Self {
        Self::new(30, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_up_to_capacity_then_denied() {
        let limiter = IngestRateLimiter::new(5, 60);
        for _ in 0..5 {
            assert!(limiter.check("digest"));
        }
        assert!(!limiter.check("digest"));
    }

    #[test]
    fn test_buckets_are_independent() {
        let limiter = IngestRateLimiter::new(1, 60);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_consume_boundary_at_exactly_one_token() {
        let mut bucket = TokenBucket::new(30.0, 0.5);
        bucket.tokens = 1.0;
        assert!(bucket.consume());

        let mut bucket = TokenBucket::new(30.0, 0.0);
        bucket.tokens = 0.999;
        assert!(!bucket.consume());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut bucket = TokenBucket::new(2.0, 1000.0);
        bucket.tokens = 0.0;
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.consume());
        // Even after a huge refill interval the bucket holds at most 2.
        assert!(bucket.tokens <= 2.0);
    }

    #[test]
    fn test_cleanup_reaps_idle_buckets() {
        let limiter = IngestRateLimiter::new(5, 60);
        limiter.check("stale");
        std::thread::sleep(Duration::from_millis(30));
        limiter.check("fresh");

        let removed = limiter.cleanup(Duration::from_millis(20));
        assert_eq!(removed, 1);
        assert_eq!(limiter.cleanup(Duration::from_secs(600)), 0);
    }
}
