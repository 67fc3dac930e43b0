//! Distributed rate limiter using Redis counters.
//!
//! Every gateway instance pointed at the same Redis shares one counter per
//! client. The counter for a client is created with the full quota and a TTL
//! equal to the window; the key expiring is what resets the window.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::backend::{Decision, RateLimiterBackend};
use super::counter::FixedWindowParams;
use super::key::ClientKey;
use crate::config::RedisConfig;
use crate::error::{RatekeeperError, Result};

/// Creates the counter if absent, then decrements it only while positive.
///
/// Returns `{allowed, remaining}`. Runs atomically on the server, so the
/// create, read and decrement cannot interleave with other callers.
const ADMIT_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2])
local remaining = tonumber(redis.call('GET', KEYS[1]))
if remaining > 0 then
  remaining = redis.call('DECR', KEYS[1])
  return {1, remaining}
end
return {0, 0}
"#;

/// A fixed-window rate limiter whose counters live in Redis.
///
/// The connection is opened on first use and retried on every check until it
/// succeeds, so an unreachable store only affects admission, never startup.
pub struct RedisRateLimiter {
    client: redis::Client,
    /// Connection URL with the password masked, for logs
    url: String,
    conn: OnceCell<ConnectionManager>,
    script: Script,
    params: FixedWindowParams,
    key_prefix: String,
    timeout: Duration,
    connect_timeout: Duration,
}

impl RedisRateLimiter {
    /// Create a limiter for the store at `config.url`.
    ///
    /// Fails only when the URL itself is unusable.
    pub fn new(config: &RedisConfig, params: FixedWindowParams) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RatekeeperError::Config(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            url: sanitize_url(&config.url),
            conn: OnceCell::new(),
            script: Script::new(ADMIT_SCRIPT),
            params,
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
            connect_timeout: config.connect_timeout(),
        })
    }

    /// The Redis key holding `client`'s counter.
    pub fn counter_key(&self, client: &ClientKey) -> String {
        counter_key(&self.key_prefix, client)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                info!(url = %self.url, "Connecting to Redis admission store");
                let conn = tokio::time::timeout(
                    self.connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| {
                    RatekeeperError::StoreUnavailable(format!(
                        "could not connect to redis within {:?}",
                        self.connect_timeout
                    ))
                })??;
                info!("Redis admission store connected");
                Ok::<_, RatekeeperError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn admit(&self, redis_key: &str) -> Result<(i64, i64)> {
        let mut conn = self.connection().await?;
        let window_secs = self.params.window.as_secs().max(1);

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(redis_key)
            .arg(self.params.quota)
            .arg(window_secs);

        let outcome: redis::RedisResult<(i64, i64)> =
            match tokio::time::timeout(self.timeout, invocation.invoke_async(&mut conn)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(RatekeeperError::StoreUnavailable(format!(
                        "redis did not answer within {:?}",
                        self.timeout
                    )))
                }
            };
        Ok(outcome?)
    }
}

#[async_trait]
impl RateLimiterBackend for RedisRateLimiter {
    async fn check(&self, key: &ClientKey) -> Result<Decision> {
        let redis_key = self.counter_key(key);
        trace!(client = %key, redis_key = %redis_key, "Checking distributed rate limit");

        let (allowed, remaining) = self.admit(&redis_key).await.map_err(|e| {
            warn!(client = %key, error = %e, "Distributed rate limit check failed");
            e
        })?;

        let remaining = remaining.max(0) as u64;
        if allowed == 1 {
            Ok(Decision::allow(remaining))
        } else {
            debug!(client = %key, quota = self.params.quota, "Distributed rate limit exceeded");
            Ok(Decision::deny(remaining))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn counter_key(prefix: &str, client: &ClientKey) -> String {
    format!("{}{}", prefix, client)
}

/// Hide the password of a Redis URL for logging.
pub(crate) fn sanitize_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid_url".to_string(),
    }
}
