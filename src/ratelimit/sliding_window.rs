//! Sliding window limiter.
//!
//! Approximates a continuously moving window by weighting the previous fixed
//! bucket by how much of it still overlaps the window ending now:
//!
//! ```text
//! effective = current + previous * (1 - position)
//! position  = (now - window_start) / window_size
//! ```
//!
//! State lives in `key:current` and `key:previous`; the base key records the
//! start of the bucket `:current` belongs to so the script can rotate the
//! buckets when a new window begins.

use async_trait::async_trait;
use std::sync::Arc;

use super::key::sub_key;
use super::limiter::{tokens_arg, BaseLimiter, LimiterCore, RateLimitResult, RateLimiter};
use crate::clock::Clock;
use crate::config::{LimiterConfig, LimiterType};
use crate::error::Result;
use crate::store::{arg_at, key_at, Keyspace, LimitScript, ScriptReply, ScriptStore, StoreError};

const SOURCE: &str = r#"
local marker_key = KEYS[1]
local current_key = KEYS[2]
local previous_key = KEYS[3]
local max_rate = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = tonumber(ARGV[4])
local expire = tonumber(ARGV[5])

if now < 0 then
    local t = redis.call("time")
    now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local window_start = math.floor(now / window_ms) * window_ms
local stored_start = tonumber(redis.call("get", marker_key) or "-1")
local current_count = tonumber(redis.call("get", current_key) or "0")
local previous_count = tonumber(redis.call("get", previous_key) or "0")

if stored_start > window_start then
    window_start = stored_start
elseif stored_start < window_start then
    if stored_start == window_start - window_ms then
        previous_count = current_count
    else
        previous_count = 0
    end
    current_count = 0
end

local position = (now - window_start) / window_ms
if position < 0 then
    position = 0
end
local effective = current_count + previous_count * (1 - position)

if effective + tokens <= max_rate then
    if tokens > 0 then
        local ttl = math.max(expire, math.ceil(window_ms * 2 / 1000))
        redis.call("set", current_key, current_count + tokens, "EX", ttl)
        redis.call("set", previous_key, previous_count, "EX", ttl)
        redis.call("set", marker_key, window_start, "EX", ttl)
    end
    return {1, math.floor(max_rate - effective - tokens), 0}
end

return {0, math.max(0, math.floor(max_rate - effective)), math.ceil(window_ms / max_rate)}
"#;

fn native(space: &mut Keyspace, keys: &[String], args: &[i64]) -> std::result::Result<Vec<i64>, StoreError> {
    let marker_key = key_at(keys, 0)?;
    let current_key = key_at(keys, 1)?;
    let previous_key = key_at(keys, 2)?;
    let max_rate = arg_at(args, 0)?;
    let window_ms = arg_at(args, 1)?;
    let now = space.resolve_now(arg_at(args, 2)?);
    let tokens = arg_at(args, 3)?;
    let expire = arg_at(args, 4)?;

    let mut window_start = now.div_euclid(window_ms) * window_ms;
    let stored_start = space.get_i64(marker_key)?.unwrap_or(-1);
    let mut current_count = space.get_i64(current_key)?.unwrap_or(0);
    let mut previous_count = space.get_i64(previous_key)?.unwrap_or(0);

    if stored_start > window_start {
        // a caller with a lagging clock keeps counting in the newest bucket
        window_start = stored_start;
    } else if stored_start < window_start {
        previous_count = if stored_start == window_start - window_ms {
            current_count
        } else {
            0
        };
        current_count = 0;
    }

    let position = ((now - window_start) as f64 / window_ms as f64).max(0.0);
    let effective = current_count as f64 + previous_count as f64 * (1.0 - position);
    let (max_rate_f, tokens_f) = (max_rate as f64, tokens as f64);

    let reply = if effective + tokens_f <= max_rate_f {
        if tokens > 0 {
            let ttl = expire.max(window_ms * 2 / 1000).max(0) as u64;
            space.set_ex(current_key, current_count + tokens, ttl);
            space.set_ex(previous_key, previous_count, ttl);
            space.set_ex(marker_key, window_start, ttl);
        }
        ScriptReply {
            allowed: true,
            remaining: (max_rate_f - effective - tokens_f).floor() as i64,
            retry_after_ms: 0,
        }
    } else {
        ScriptReply {
            allowed: false,
            remaining: (max_rate_f - effective).floor().max(0.0) as i64,
            retry_after_ms: window_ms / max_rate + i64::from(window_ms % max_rate != 0),
        }
    };
    Ok(reply.into_values())
}

pub(crate) static SCRIPT: LimitScript = LimitScript::new("sliding_window", SOURCE, native);

/// Sliding window limiter over two adjacent fixed buckets.
pub struct SlidingWindowLimiter {
    core: LimiterCore,
}

impl SlidingWindowLimiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn ScriptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: LimiterCore::new(config, store, clock),
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
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
                    vec![
                        limiter_key.to_string(),
                        sub_key(limiter_key, "current"),
                        sub_key(limiter_key, "previous"),
                    ],
                    args,
                )
            })
            .await
    }

    fn limiter_type(&self) -> LimiterType {
        LimiterType::SlidingWindow
    }

    fn base(&self) -> &BaseLimiter {
        &self.core.base
    }
}
