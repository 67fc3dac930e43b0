//! Token bucket implementation for rate limiting.

use std::time::Instant;

use super::store::LimiterState;
use crate::config::TokenBucketConfig;

/// Burst capacity and refill rate shared by every bucket of a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketParams {
    /// Maximum tokens (burst capacity).
    pub capacity: u32,
    /// Token refill rate (tokens per second).
    pub refill_rate: f64,
}

impl From<&TokenBucketConfig> for TokenBucketParams {
    fn from(config: &TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
        }
    }
}

/// A token bucket.
///
/// Allows bursts up to `capacity` while limiting the long-term rate to
/// `refill_rate` tokens per second. `tokens` stays within `0..=capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    params: TokenBucketParams,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(params: TokenBucketParams, now: Instant) -> Self {
        Self {
            params,
            tokens: f64::from(params.capacity),
            last_refill: now,
        }
    }

    /// Tokens available at `now`, without mutating the bucket.
    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.params.refill_rate).min(f64::from(self.params.capacity))
    }

    /// Refill tokens based on elapsed time.
    fn refill(&mut self, now: Instant) {
        // A caller holding an earlier timestamp must not move the clock back.
        if now <= self.last_refill {
            return;
        }
        self.tokens = self.available(now);
        self.last_refill = now;
    }
}

impl LimiterState for TokenBucket {
    type Config = TokenBucketParams;

    fn new(config: &Self::Config, now: Instant) -> Self {
        TokenBucket::new(*config, now)
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }

    fn remaining(&self, now: Instant) -> u64 {
        self.available(now).floor() as u64
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.available(now) >= f64::from(self.params.capacity)
    }
}
