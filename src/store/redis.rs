//! Redis-backed script store.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{LimitScript, ScriptStore, StoreError};

/// Default deadline for establishing the initial connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`ScriptStore`] that runs scripts on Redis with `EVALSHA`, falling back
/// to `EVAL` when the server has not cached the script yet.
///
/// Cloning is cheap: the connection manager multiplexes one connection and the
/// script cache is shared.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    scripts: Arc<DashMap<&'static str, Script>>,
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            scripts: Arc::new(DashMap::new()),
        }
    }

    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_timeout(url, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to the Redis server at `url`, giving up after `timeout`.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Unavailable(format!("connecting to {url} timed out")))??;

        info!(url = %url, "Connected to Redis store");
        Ok(Self::new(connection))
    }

    fn script(&self, script: &LimitScript) -> Script {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| {
                debug!(script = script.name(), "Caching limiter script");
                Script::new(script.source())
            })
            .value()
            .clone()
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn eval(
        &self,
        script: &LimitScript,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        let redis_script = self.script(script);
        let mut invocation = redis_script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(*arg);
        }

        let mut con = self.connection.clone();
        let values: Vec<i64> = invocation.invoke_async(&mut con).await?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::config::{ClockSource, LimiterConfig, LimiterType, TimeUnit};
    use crate::plugin::PluginRegistry;
    use crate::ratelimit::{LimiterService, RateLimiter};
    use crate::store::{Keyspace, MemoryStore, ScriptReply, ScriptStore};

    const ALL_TYPES: [LimiterType; 4] = [
        LimiterType::Counter,
        LimiterType::SlidingWindow,
        LimiterType::TokenBucket,
        LimiterType::LeakyBucket,
    ];

    fn native_unused(
        _space: &mut Keyspace,
        _keys: &[String],
        _args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        Ok(vec![1, 0, 0])
    }

    static SUM: LimitScript = LimitScript::new(
        "test_sum",
        r#"
        local total = redis.call("incrby", KEYS[1], ARGV[1])
        redis.call("expire", KEYS[1], 60)
        return {1, total, 0}
        "#,
        native_unused,
    );

    // Tests use unique keys so they may run concurrently against one server.
    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn get_test_store() -> Option<RedisStore> {
        RedisStore::connect_with_timeout(&redis_url(), Duration::from_secs(1))
            .await
            .ok()
    }

    async fn raw_get(key: &str) -> Option<String> {
        let client = Client::open(redis_url()).unwrap();
        let mut con = client.get_multiplexed_async_connection().await.unwrap();
        redis::cmd("GET").arg(key).query_async(&mut con).await.unwrap()
    }

    // Redis may render whole numbers in exponent form, so compare numerically.
    fn as_number(value: Option<String>) -> Option<f64> {
        value.and_then(|v| v.parse().ok())
    }

    fn state_keys(limiter_type: LimiterType, base: &str) -> Vec<String> {
        let suffixes: &[&str] = match limiter_type {
            LimiterType::Counter => &[],
            LimiterType::SlidingWindow => &["current", "previous"],
            LimiterType::TokenBucket => &["ts"],
            LimiterType::LeakyBucket => &["last", "queue"],
        };
        std::iter::once(base.to_string())
            .chain(suffixes.iter().map(|s| format!("{base}:{s}")))
            .collect()
    }

    /// One limiter over Redis and one over the memory store, sharing a clock.
    fn limiter_pair(
        redis: &Arc<dyn ScriptStore>,
        memory: &Arc<dyn ScriptStore>,
        clock: Arc<dyn Clock>,
        config: LimiterConfig,
    ) -> (Arc<dyn RateLimiter>, Arc<dyn RateLimiter>) {
        let registry = Arc::new(PluginRegistry::new());
        let lua = LimiterService::with_clock(redis.clone(), registry.clone(), clock.clone())
            .create_limiter(config.clone())
            .unwrap();
        let native = LimiterService::with_clock(memory.clone(), registry, clock)
            .create_limiter(config)
            .unwrap();
        (lua, native)
    }

    #[tokio::test]
    async fn test_eval_runs_script_atomically() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };
        let key = format!("floodgate:test:{}", uuid::Uuid::new_v4());
        let keys = vec![key];

        let reply = ScriptReply::from_values(&store.eval(&SUM, &keys, &[3]).await.unwrap()).unwrap();
        assert_eq!(reply.remaining, 3);
        let reply = ScriptReply::from_values(&store.eval(&SUM, &keys, &[4]).await.unwrap()).unwrap();
        assert_eq!(reply.remaining, 7);
        assert_eq!(store.scripts.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let result =
            RedisStore::connect_with_timeout("redis://127.0.0.1:1", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_lua_scripts_agree_with_native_scripts() {
        let redis: Arc<dyn ScriptStore> = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let steps: [(i64, u64); 12] = [
            (0, 3),
            (0, 4),
            (0, 1),
            (10, 5),
            (150, 2),
            (1, 0),
            (700, 6),
            (0, 10),
            (2_500, 1),
            (333, 4),
            (90, 7),
            (0, 0),
        ];

        for limiter_type in ALL_TYPES {
            let clock = Arc::new(ManualClock::new(1_700_000_000_000));
            let memory_store = Arc::new(MemoryStore::with_clock(clock.clone()));
            let memory: Arc<dyn ScriptStore> = memory_store.clone();
            let prefix = format!("floodgate:test:{}", uuid::Uuid::new_v4());
            // 7 per second leaves a fractional per-unit interval
            let config = LimiterConfig::new(limiter_type, 7, TimeUnit::Second)
                .with_key_prefix(prefix.clone())
                .with_expire_time(60);
            let (lua, native) = limiter_pair(&redis, &memory, clock.clone(), config);

            let base = format!("{prefix}:global:k");
            for (step, (advance, tokens)) in steps.iter().enumerate() {
                clock.advance(*advance);
                let from_lua = lua.allow("k", *tokens).await.unwrap();
                let from_native = native.allow("k", *tokens).await.unwrap();
                assert_eq!(from_lua, from_native, "{limiter_type} step {step}");

                for key in state_keys(limiter_type, &base) {
                    assert_eq!(
                        as_number(raw_get(&key).await),
                        as_number(memory_store.get(&key)),
                        "{limiter_type} step {step} key {key}"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_counter_round_values_stay_integers() {
        let redis: Arc<dyn ScriptStore> = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let memory: Arc<dyn ScriptStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = LimiterConfig::new(LimiterType::Counter, 1_000_000_000, TimeUnit::Second)
            .with_key_prefix(format!("floodgate:test:{}", uuid::Uuid::new_v4()))
            .with_expire_time(60);
        let (lua, native) = limiter_pair(&redis, &memory, clock, config);

        // the second call increments the value the first one created
        for _ in 0..2 {
            let from_lua = lua.allow("k", 100_000_000).await.unwrap();
            assert_eq!(from_lua, native.allow("k", 100_000_000).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_store_clock_reads_server_time() {
        let redis: Arc<dyn ScriptStore> = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let memory: Arc<dyn ScriptStore> = Arc::new(MemoryStore::new());
        // the limiters' own clock is decades off and must not be consulted
        let stale: Arc<dyn Clock> = Arc::new(ManualClock::new(0));

        for limiter_type in ALL_TYPES {
            let prefix = format!("floodgate:test:{}", uuid::Uuid::new_v4());
            let config = LimiterConfig::new(limiter_type, 5, TimeUnit::Hour)
                .with_key_prefix(prefix.clone())
                .with_clock_source(ClockSource::Store);
            let (lua, native) = limiter_pair(&redis, &memory, stale.clone(), config);

            for tokens in [2, 2, 2, 0, 1] {
                let from_lua = lua.allow("k", tokens).await.unwrap();
                let from_native = native.allow("k", tokens).await.unwrap();
                assert_eq!(
                    (from_lua.allowed, from_lua.remaining),
                    (from_native.allowed, from_native.remaining),
                    "{limiter_type} tokens {tokens}"
                );
            }

            if limiter_type == LimiterType::TokenBucket {
                let stamp = as_number(raw_get(&format!("{prefix}:global:k:ts")).await).unwrap();
                let now = SystemClock.now_ms() as f64;
                assert!((stamp - now).abs() < 60_000.0, "refill stamp {stamp} far from {now}");
            }
        }
    }
}
