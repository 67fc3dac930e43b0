//! Core in-process rate limiter implementation.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::bucket::TokenBucket;
use super::counter::FixedWindowCounter;
use super::key::ClientKey;
use super::store::{LimiterState, MemoryStore};
use crate::error::Result;

/// Token-bucket limiter over the in-process store.
pub type TokenBucketLimiter = RateLimiter<TokenBucket>;
/// Fixed-window limiter over the in-process store.
pub type FixedWindowLimiter = RateLimiter<FixedWindowCounter>;

/// The in-process rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter<S: LimiterState> {
    /// Per-client state indexed by client key
    store: MemoryStore<S>,
}

impl<S: LimiterState> RateLimiter<S> {
    /// Create a new rate limiter whose clients all start from `config`.
    pub fn new(config: S::Config) -> Self {
        Self {
            store: MemoryStore::new(config),
        }
    }

    /// Check the rate limit for a client at the given instant.
    pub fn check_at(&self, key: &ClientKey, now: Instant) -> Decision {
        trace!(client = %key, "Checking rate limit");

        let decision = self.store.with_state(key, now, |state| {
            if state.try_acquire(now) {
                Decision::allow(state.remaining(now))
            } else {
                Decision::deny(state.remaining(now))
            }
        });

        if !decision.allowed {
            debug!(client = %key, "Rate limit exceeded");
        }
        decision
    }

    /// Get the number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.store.len()
    }

    /// Evict idle clients every `interval` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let evicted = limiter.store.evict_idle(Instant::now());
                if evicted > 0 {
                    debug!(
                        evicted = evicted,
                        remaining = limiter.client_count(),
                        "Swept idle clients"
                    );
                }
            }
        })
    }
}

#[async_trait]
impl<S: LimiterState> RateLimiterBackend for RateLimiter<S> {
    async fn check(&self, key: &ClientKey) -> Result<Decision> {
        Ok(self.check_at(key, Instant::now()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
