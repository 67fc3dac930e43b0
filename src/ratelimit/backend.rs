//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::key::ClientKey;
use crate::error::Result;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole units of allowance left after this check
    pub remaining: u64,
}

impl Decision {
    pub fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
        }
    }

    pub fn deny(remaining: u64) -> Self {
        Self {
            allowed: false,
            remaining,
        }
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-process `RateLimiter` and the
/// Redis-backed `RedisRateLimiter` so the admission middleware works with
/// either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide admission for `key`, consuming one unit of allowance when
    /// the request is allowed.
    ///
    /// Errors only signal that the state store could not answer.
    async fn check(&self, key: &ClientKey) -> Result<Decision>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
