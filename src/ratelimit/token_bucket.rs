//! Token bucket limiter.
//!
//! A bucket of `max_rate` tokens refills continuously at `max_rate` per time
//! unit. Requests take tokens out; a request larger than what is in the bucket
//! is denied and told how long the refill will take.

use async_trait::async_trait;
use std::sync::Arc;

use super::key::sub_key;
use super::limiter::{tokens_arg, BaseLimiter, LimiterCore, RateLimitResult, RateLimiter};
use crate::clock::Clock;
use crate::config::{LimiterConfig, LimiterType};
use crate::error::Result;
use crate::store::{arg_at, key_at, Keyspace, LimitScript, ScriptReply, ScriptStore, StoreError};

const SOURCE: &str = r#"
local tokens_key = KEYS[1]
local timestamp_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local expire = tonumber(ARGV[5])

if now < 0 then
    local t = redis.call("time")
    now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local last_tokens = tonumber(redis.call("get", tokens_key))
local last_refill = tonumber(redis.call("get", timestamp_key))
if last_tokens == nil or last_refill == nil then
    last_tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
local filled = math.min(capacity, last_tokens + elapsed * capacity / window_ms)

if requested == 0 then
    return {1, math.floor(filled), 0}
end

local allowed = filled >= requested
local new_tokens = filled
if allowed then
    new_tokens = filled - requested
end

redis.call("set", tokens_key, new_tokens, "EX", expire)
redis.call("set", timestamp_key, math.max(now, last_refill), "EX", expire)

if allowed then
    return {1, math.floor(new_tokens), 0}
end
return {0, math.floor(new_tokens), math.ceil((requested - filled) * window_ms / capacity)}
"#;

fn native(space: &mut Keyspace, keys: &[String], args: &[i64]) -> std::result::Result<Vec<i64>, StoreError> {
    let tokens_key = key_at(keys, 0)?;
    let timestamp_key = key_at(keys, 1)?;
    let capacity = arg_at(args, 0)? as f64;
    let window_ms = arg_at(args, 1)? as f64;
    let now = space.resolve_now(arg_at(args, 2)?);
    let requested = arg_at(args, 3)? as f64;
    let expire = arg_at(args, 4)?.max(0) as u64;

    let (last_tokens, last_refill) = match (space.get_f64(tokens_key)?, space.get_i64(timestamp_key)?) {
        (Some(tokens), Some(refill)) => (tokens, refill),
        _ => (capacity, now),
    };

    let elapsed = (now - last_refill).max(0) as f64;
    let filled = capacity.min(last_tokens + elapsed * capacity / window_ms);

    if requested == 0.0 {
        return Ok(ScriptReply {
            allowed: true,
            remaining: filled.floor() as i64,
            retry_after_ms: 0,
        }
        .into_values());
    }

    let allowed = filled >= requested;
    let new_tokens = if allowed { filled - requested } else { filled };

    space.set_ex(tokens_key, new_tokens, expire);
    space.set_ex(timestamp_key, now.max(last_refill), expire);

    let retry_after_ms = if allowed {
        0
    } else {
        ((requested - filled) * window_ms / capacity).ceil() as i64
    };
    Ok(ScriptReply {
        allowed,
        remaining: new_tokens.floor() as i64,
        retry_after_ms,
    }
    .into_values())
}

pub(crate) static SCRIPT: LimitScript = LimitScript::new("token_bucket", SOURCE, native);

/// Token bucket limiter storing a fractional token count and refill time.
pub struct TokenBucketLimiter {
    core: LimiterCore,
}

impl TokenBucketLimiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn ScriptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: LimiterCore::new(config, store, clock),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self, key: &str, tokens: u64) -> Result<RateLimitResult> {
        let args = vec![
            self.core.max_rate() as i64,
            self.core.window_ms(),
            self.core.now_arg(),
            tokens_arg(tokens),
            self.core.expire_secs(),
        ];
        self.core
            .enforce(&SCRIPT, key, tokens, move |limiter_key| {
                (
                    vec![limiter_key.to_string(), sub_key(limiter_key, "ts")],
                    args,
                )
            })
            .await
    }

    fn limiter_type(&self) -> LimiterType {
        LimiterType::TokenBucket
    }

    fn base(&self) -> &BaseLimiter {
        &self.core.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TimeUnit;
    use crate::store::MemoryStore;

    const EPOCH: i64 = 1_700_000_000_000;
    const KEY: &str = "tb:global:k";

    fn setup(max_rate: u64) -> (TokenBucketLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = LimiterConfig::new(LimiterType::TokenBucket, max_rate, TimeUnit::Second)
            .with_key_prefix("tb")
            .with_expire_time(60);
        let limiter = TokenBucketLimiter::new(config, store.clone(), clock.clone());
        (limiter, store, clock)
    }

    fn stored_tokens(store: &MemoryStore) -> f64 {
        store.get(KEY).and_then(|v| v.parse().ok()).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_bucket_is_full() {
        let (limiter, store, _) = setup(10);
        let result = limiter.allow("k", 4).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 6);
        assert_eq!(stored_tokens(&store), 6.0);
        assert_eq!(store.get("tb:global:k:ts"), Some(EPOCH.to_string()));
    }

    #[tokio::test]
    async fn test_refill_and_retry_after() {
        let (limiter, _, clock) = setup(10);
        assert!(limiter.allow("k", 10).await.unwrap().allowed);

        let denied = limiter.allow("k", 3).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // 3 tokens at 10 per second
        assert_eq!(denied.retry_after_ms, 300);

        clock.advance(300);
        let result = limiter.allow("k", 3).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_denial_refreshes_timestamp_without_spending() {
        let (limiter, store, clock) = setup(10);
        limiter.allow("k", 10).await.unwrap();

        clock.advance(150);
        assert!(!limiter.allow("k", 5).await.unwrap().allowed);
        assert_eq!(stored_tokens(&store), 1.5);
        assert_eq!(store.get("tb:global:k:ts"), Some((EPOCH + 150).to_string()));
    }

    #[tokio::test]
    async fn test_tokens_stay_within_capacity() {
        let (limiter, store, clock) = setup(5);
        let pattern = [(0, 1), (10, 3), (1_000, 2), (5_000, 0), (1, 5), (400, 4), (3, 1), (250, 2)];

        for round in 0..4 {
            for (advance, tokens) in pattern {
                clock.advance(advance + round);
                let result = limiter.allow("k", tokens).await.unwrap();
                assert!(result.remaining <= 5);
                if let Some(stored) = store.get(KEY).and_then(|v| v.parse::<f64>().ok()) {
                    assert!((0.0..=5.0).contains(&stored), "stored tokens {stored} out of range");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_zero_token_query_changes_nothing() {
        let (limiter, store, _) = setup(10);
        let first = limiter.allow("k", 1).await.unwrap();
        let before = store.snapshot();

        let peek = limiter.allow("k", 0).await.unwrap();
        assert!(peek.allowed);
        assert_eq!(peek.remaining, first.remaining);
        assert_eq!(store.snapshot(), before);

        let second = limiter.allow("k", 1).await.unwrap();
        assert_eq!(second.remaining, first.remaining - 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (limiter, store, _) = setup(3);
        store.fail_with("down");
        let result = limiter.allow("k", 100).await.unwrap();
        assert_eq!(result, RateLimitResult::allowed(3));
    }
}
