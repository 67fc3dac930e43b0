//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod counter;
mod distributed;
mod key;
mod limiter;
mod store;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use backend::{Decision, RateLimiterBackend};
pub use bucket::{TokenBucket, TokenBucketParams};
pub use counter::{FixedWindowCounter, FixedWindowParams};
pub use distributed::RedisRateLimiter;
pub use key::ClientKey;
pub use limiter::{FixedWindowLimiter, RateLimiter, TokenBucketLimiter};
pub use store::{LimiterState, MemoryStore};

use crate::config::{Algorithm, Backend, RateLimitingConfig};
use crate::error::Result;

/// Build the admission backend selected by configuration.
///
/// Starts the idle sweep for in-process backends when one is configured. The
/// Redis backend connects on its first check, so a store that is down at
/// startup is left to the failure policy.
/// Must be called from within a tokio runtime.
pub async fn build_backend(config: &RateLimitingConfig) -> Result<Arc<dyn RateLimiterBackend>> {
    let sweep = config.sweep_interval_secs.map(Duration::from_secs);

    let backend: Arc<dyn RateLimiterBackend> = match (config.backend, config.algorithm) {
        (Backend::Memory, Algorithm::TokenBucket) => {
            let params = TokenBucketParams::from(&config.token_bucket);
            info!(
                capacity = params.capacity,
                refill_rate = params.refill_rate,
                "Using in-process token bucket limiter"
            );
            local_backend(TokenBucketLimiter::new(params), sweep)
        }
        (Backend::Memory, Algorithm::FixedWindow) => {
            let params = FixedWindowParams::from(&config.fixed_window);
            info!(
                quota = params.quota,
                window_secs = params.window.as_secs(),
                "Using in-process fixed window limiter"
            );
            local_backend(FixedWindowLimiter::new(params), sweep)
        }
        (Backend::Redis, Algorithm::FixedWindow) => {
            let params = FixedWindowParams::from(&config.fixed_window);
            info!(
                quota = params.quota,
                window_secs = params.window.as_secs(),
                "Using Redis fixed window limiter"
            );
            Arc::new(RedisRateLimiter::new(&config.redis, params)?)
        }
        (Backend::Redis, Algorithm::TokenBucket) => {
            return Err(crate::error::RatekeeperError::Config(
                "the redis backend only supports the fixed_window algorithm".to_string(),
            ))
        }
    };

    Ok(backend)
}

fn local_backend<S: LimiterState>(
    limiter: RateLimiter<S>,
    sweep: Option<Duration>,
) -> Arc<dyn RateLimiterBackend> {
    let limiter = Arc::new(limiter);
    if let Some(interval) = sweep {
        info!(interval_secs = interval.as_secs(), "Idle client sweep enabled");
        // The task exits on its own once the limiter is dropped
        limiter.spawn_sweeper(interval);
    }
    limiter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_default_backend() {
        let backend = build_backend(&RateLimitingConfig::default()).await.unwrap();
        assert_eq!(backend.name(), "memory");

        let key = ClientKey::new("first");
        for _ in 0..5 {
            assert!(backend.check(&key).await.unwrap().allowed);
        }
        assert!(!backend.check(&key).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_build_fixed_window_backend_with_sweep() {
        let config = RateLimitingConfig {
            algorithm: Algorithm::FixedWindow,
            sweep_interval_secs: Some(60),
            ..Default::default()
        };
        let backend = build_backend(&config).await.unwrap();
        assert_eq!(backend.name(), "memory");

        let decision = backend.check(&ClientKey::new("c")).await.unwrap();
        assert_eq!(decision, Decision::allow(99));
    }

    #[tokio::test]
    async fn test_build_redis_backend_with_store_down() {
        let mut config = RateLimitingConfig {
            backend: Backend::Redis,
            algorithm: Algorithm::FixedWindow,
            ..Default::default()
        };
        config.redis.url = "redis://127.0.0.1:1".to_string();
        config.redis.connect_timeout_ms = 200;

        let backend = build_backend(&config).await.unwrap();
        assert_eq!(backend.name(), "redis");

        let err = backend.check(&ClientKey::new("c")).await.unwrap_err();
        assert!(matches!(err, crate::error::RatekeeperError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_build_redis_backend_with_bad_url() {
        let mut config = RateLimitingConfig {
            backend: Backend::Redis,
            algorithm: Algorithm::FixedWindow,
            ..Default::default()
        };
        config.redis.url = "not a redis url".to_string();

        let err = build_backend(&config).await.err().unwrap();
        assert!(matches!(err, crate::error::RatekeeperError::Config(_)));
    }

    #[tokio::test]
    async fn test_redis_token_bucket_rejected() {
        let config = RateLimitingConfig {
            backend: Backend::Redis,
            ..Default::default()
        };
        assert!(build_backend(&config).await.is_err());
    }
}
