//! Fixed counter limiter.
//!
//! Counts units in a single integer key. The key expires `expire_time`
//! seconds after the first admission in a window, and that expiry is what
//! resets the count. The window is anchored at that first admission: later
//! admissions use `INCRBY` and never push the TTL out, so a key under steady
//! traffic still resets on schedule. Cheap and simple, but a caller can fit up
//! to twice the limit into two adjacent windows.

use async_trait::async_trait;
use std::sync::Arc;

use super::limiter::{tokens_arg, BaseLimiter, LimiterCore, RateLimitResult, RateLimiter};
use crate::clock::Clock;
use crate::config::{LimiterConfig, LimiterType};
use crate::error::Result;
use crate::store::{arg_at, key_at, Keyspace, LimitScript, ScriptReply, ScriptStore, StoreError};

const SOURCE: &str = r#"
local key = KEYS[1]
local max_rate = tonumber(ARGV[1])
local tokens = tonumber(ARGV[2])
local expire = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[4])

local current = tonumber(redis.call("get", key) or "0")
local next_count = current + tokens

if next_count <= max_rate then
    if tokens > 0 then
        if redis.call("exists", key) == 0 then
            redis.call("set", key, string.format("%d", next_count), "EX", expire)
        else
            redis.call("incrby", key, tokens)
        end
    end
    return {1, max_rate - next_count, 0}
end

return {0, math.max(0, max_rate - current), math.ceil(window_ms / max_rate)}
"#;

fn native(space: &mut Keyspace, keys: &[String], args: &[i64]) -> std::result::Result<Vec<i64>, StoreError> {
    let key = key_at(keys, 0)?;
    let max_rate = arg_at(args, 0)?;
    let tokens = arg_at(args, 1)?;
    let expire = arg_at(args, 2)?;
    let window_ms = arg_at(args, 3)?;

    let current = space.get_i64(key)?;
    let count = current.unwrap_or(0);
    let next_count = count.saturating_add(tokens);

    let reply = if next_count <= max_rate {
        if tokens > 0 {
            match current {
                None => space.set_ex(key, next_count, expire.max(0) as u64),
                Some(_) => {
                    space.incr_by(key, tokens)?;
                }
            }
        }
        ScriptReply {
            allowed: true,
            remaining: max_rate - next_count,
            retry_after_ms: 0,
        }
    } else {
        ScriptReply {
            allowed: false,
            remaining: (max_rate - count).max(0),
            retry_after_ms: div_ceil(window_ms, max_rate),
        }
    };
    Ok(reply.into_values())
}

fn div_ceil(a: i64, b: i64) -> i64 {
    a / b + i64::from(a % b != 0)
}

pub(crate) static SCRIPT: LimitScript = LimitScript::new("fixed_counter", SOURCE, native);

/// Fixed counter backed by one expiring integer key.
pub struct FixedCounterLimiter {
    core: LimiterCore,
}

impl FixedCounterLimiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn ScriptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: LimiterCore::new(config, store, clock),
        }
    }
}

#[async_trait]
impl RateLimiter for FixedCounterLimiter {
    async fn allow(&self, key: &str, tokens: u64) -> Result<RateLimitResult> {
        let max_rate = self.core.max_rate() as i64;
        let expire = self.core.expire_secs();
        let window_ms = self.core.window_ms();
        self.core
            .enforce(&SCRIPT, key, tokens, |limiter_key| {
                (
                    vec![limiter_key.to_string()],
                    vec![max_rate, tokens_arg(tokens), expire, window_ms],
                )
            })
            .await
    }

    fn limiter_type(&self) -> LimiterType {
        LimiterType::Counter
    }

    fn base(&self) -> &BaseLimiter {
        &self.core.base
    }
}
