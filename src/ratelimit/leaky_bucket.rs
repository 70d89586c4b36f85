//! Leaky bucket limiter.
//!
//! Admitted units join a queue of at most `max_rate` entries that drains at
//! `max_rate` per time unit. The leak clock at `key:last` only moves forward by
//! the time that was actually turned into leaked units, so callers arriving
//! more often than one unit's drain time still see the queue empty out. It is
//! kept in fractional milliseconds since one unit's drain time is rarely a
//! whole number of them.

use async_trait::async_trait;
use std::sync::Arc;

use super::key::sub_key;
use super::limiter::{tokens_arg, BaseLimiter, LimiterCore, RateLimitResult, RateLimiter};
use crate::clock::Clock;
use crate::config::{LimiterConfig, LimiterType};
use crate::error::Result;
use crate::store::{arg_at, key_at, Keyspace, LimitScript, ScriptReply, ScriptStore, StoreError};

const SOURCE: &str = r#"
local admitted_key = KEYS[1]
local last_key = KEYS[2]
local queue_key = KEYS[3]
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local expire = tonumber(ARGV[5])

if now < 0 then
    local t = redis.call("time")
    now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local queue = tonumber(redis.call("get", queue_key) or "0")
local last = tonumber(redis.call("get", last_key) or tostring(now))

local elapsed = math.max(0, now - last)
local leaked = math.min(queue, math.floor(elapsed * capacity / window_ms))
local new_queue = queue - leaked
if new_queue == 0 then
    last = math.max(now, last)
elseif leaked > 0 then
    last = last + leaked * window_ms / capacity
end

if requested == 0 then
    return {1, capacity - new_queue, 0}
end

if new_queue + requested <= capacity then
    redis.call("set", queue_key, new_queue + requested, "EX", expire)
    redis.call("set", last_key, last, "EX", expire)
    redis.call("set", admitted_key, now, "EX", expire)
    return {1, capacity - new_queue - requested, 0}
end

redis.call("set", queue_key, new_queue, "EX", expire)
redis.call("set", last_key, last, "EX", expire)

local deficit = new_queue + requested - capacity
local retry = math.ceil(last + deficit * window_ms / capacity - now)
retry = math.min(retry, math.ceil(requested * window_ms / capacity))
return {0, capacity - new_queue, math.max(1, retry)}
"#;

fn native(space: &mut Keyspace, keys: &[String], args: &[i64]) -> std::result::Result<Vec<i64>, StoreError> {
    let admitted_key = key_at(keys, 0)?;
    let last_key = key_at(keys, 1)?;
    let queue_key = key_at(keys, 2)?;
    let capacity = arg_at(args, 0)?;
    let window_ms = arg_at(args, 1)?;
    let now = space.resolve_now(arg_at(args, 2)?);
    let requested = arg_at(args, 3)?;
    let expire = arg_at(args, 4)?.max(0) as u64;

    let (cap_f, window_f) = (capacity as f64, window_ms as f64);
    let queue = space.get_i64(queue_key)?.unwrap_or(0);
    let now_f = now as f64;
    let mut last = space.get_f64(last_key)?.unwrap_or(now_f);

    let elapsed = (now_f - last).max(0.0);
    let leaked = queue.min((elapsed * cap_f / window_f).floor() as i64);
    let new_queue = queue - leaked;
    if new_queue == 0 {
        last = last.max(now_f);
    } else if leaked > 0 {
        last += leaked as f64 * window_f / cap_f;
    }

    if requested == 0 {
        return Ok(ScriptReply {
            allowed: true,
            remaining: capacity - new_queue,
            retry_after_ms: 0,
        }
        .into_values());
    }

    let queued = new_queue.saturating_add(requested);
    if queued <= capacity {
        space.set_ex(queue_key, queued, expire);
        space.set_ex(last_key, last, expire);
        space.set_ex(admitted_key, now, expire);
        return Ok(ScriptReply {
            allowed: true,
            remaining: capacity - queued,
            retry_after_ms: 0,
        }
        .into_values());
    }

    space.set_ex(queue_key, new_queue, expire);
    space.set_ex(last_key, last, expire);

    let deficit = (queued - capacity) as f64;
    let until_drained = (last + deficit * window_f / cap_f - now_f).ceil();
    let bound = (requested as f64 * window_f / cap_f).ceil();
    Ok(ScriptReply {
        allowed: false,
        remaining: capacity - new_queue,
        retry_after_ms: (until_drained.min(bound) as i64).max(1),
    }
    .into_values())
}

pub(crate) static SCRIPT: LimitScript = LimitScript::new("leaky_bucket", SOURCE, native);

/// Leaky bucket limiter over a queue length and a leak clock.
pub struct LeakyBucketLimiter {
    core: LimiterCore,
}

impl LeakyBucketLimiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn ScriptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: LimiterCore::new(config, store, clock),
        }
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
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
                        sub_key(limiter_key, "last"),
                        sub_key(limiter_key, "queue"),
                    ],
                    args,
                )
            })
            .await
    }

    fn limiter_type(&self) -> LimiterType {
        LimiterType::LeakyBucket
    }

    fn base(&self) -> &BaseLimiter {
        &self.core.base
    }
}
