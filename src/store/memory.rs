//! In-process script store.
//!
//! Runs the native twin of each [`LimitScript`] while holding one lock over
//! the whole keyspace, which gives the same all-or-nothing visibility a Redis
//! script has. Expiry is evaluated lazily against the store's [`Clock`].
//! Besides single-process deployments it is the store the algorithm tests
//! drive, so it also counts calls and can be told to fail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{LimitScript, ScriptStore, StoreError, STORE_TIME};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<i64>,
}

/// The keyspace a native script operates on.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
    now_ms: i64,
}

impl Keyspace {
    /// Store server time for the current script execution.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Resolve a caller-supplied timestamp, honoring [`STORE_TIME`].
    pub fn resolve_now(&self, requested: i64) -> i64 {
        if requested == STORE_TIME {
            self.now_ms
        } else {
            requested
        }
    }

    fn live(&self, key: &str) -> Option<&Entry> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at.map_or(true, |at| at > self.now_ms))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.live(key).map(|e| e.value.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.get(key)
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| StoreError::Script(format!("value at {key} is not an integer")))
            })
            .transpose()
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, StoreError> {
        self.get(key)
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| StoreError::Script(format!("value at {key} is not a number")))
            })
            .transpose()
    }

    /// `SET key value EX ttl`.
    pub fn set_ex(&mut self, key: &str, value: impl ToString, ttl_secs: u64) {
        let expires_at = self.now_ms + (ttl_secs as i64) * 1000;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
    }

    /// `INCRBY key delta`, keeping any TTL already set.
    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let current = self.get_i64(key)?;
        let expires_at = current.and_then(|_| self.entries.get(key).and_then(|e| e.expires_at));
        let next = current.unwrap_or(0) + delta;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    /// `EXPIRE key ttl`; a missing key is left alone.
    pub fn expire(&mut self, key: &str, ttl_secs: u64) {
        let now = self.now_ms;
        if self.live(key).is_some() {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.expires_at = Some(now + (ttl_secs as i64) * 1000);
            }
        }
    }

    /// Remaining time to live in milliseconds, `None` for missing or persistent keys.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        self.live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at - self.now_ms)
    }

    fn purge_expired(&mut self) {
        let now = self.now_ms;
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }
}

/// A [`ScriptStore`] held entirely in process memory.
pub struct MemoryStore {
    space: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
    calls: AtomicU64,
    failure: Mutex<Option<String>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Create a store that keeps time with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that keeps time with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            space: Mutex::new(Keyspace::default()),
            clock,
            calls: AtomicU64::new(0),
            failure: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Number of script executions attempted so far.
    pub fn eval_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every following call fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    /// Stop injecting failures.
    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Delay every following call by `latency` before it touches the keyspace.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Read a live value.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut space = self.space.lock();
        space.now_ms = self.clock.now_ms();
        space.get(key).map(str::to_owned)
    }

    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        let mut space = self.space.lock();
        space.now_ms = self.clock.now_ms();
        space.ttl_ms(key)
    }

    /// All live keys and values, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut space = self.space.lock();
        space.now_ms = self.clock.now_ms();
        space.purge_expired();
        space
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.space.lock().entries.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval(
        &self,
        script: &LimitScript,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self.failure.lock().clone() {
            return Err(StoreError::Unavailable(message));
        }

        trace!(script = script.name(), keys = ?keys, args = ?args, "Executing native script");

        let mut space = self.space.lock();
        space.now_ms = self.clock.now_ms();
        space.purge_expired();
        script.run_native(&mut space, keys, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn echo_script(space: &mut Keyspace, keys: &[String], args: &[i64]) -> Result<Vec<i64>, StoreError> {
        let total = space.incr_by(&keys[0], args[0])?;
        Ok(vec![total])
    }

    static ECHO: LimitScript = LimitScript::new("echo", "return 0", echo_script);

    #[test]
    fn test_keyspace_expiry() {
        let mut space = Keyspace::default();
        space.set_ex("k", 5, 2);
        assert_eq!(space.get_i64("k").unwrap(), Some(5));
        assert_eq!(space.ttl_ms("k"), Some(2000));

        space.now_ms = 1_999;
        assert_eq!(space.get("k"), Some("5"));
        space.now_ms = 2_000;
        assert_eq!(space.get("k"), None);
    }

    #[test]
    fn test_incr_keeps_ttl() {
        let mut space = Keyspace::default();
        space.set_ex("k", 1, 10);
        space.now_ms = 4_000;
        assert_eq!(space.incr_by("k", 2).unwrap(), 3);
        assert_eq!(space.ttl_ms("k"), Some(6_000));

        assert_eq!(space.incr_by("fresh", 4).unwrap(), 4);
        assert_eq!(space.ttl_ms("fresh"), None);
    }

    #[test]
    fn test_non_numeric_value_is_a_script_error() {
        let mut space = Keyspace::default();
        space.set_ex("k", "abc", 10);
        assert!(matches!(space.get_i64("k"), Err(StoreError::Script(_))));
        assert!(matches!(space.get_f64("k"), Err(StoreError::Script(_))));
    }

    #[test]
    fn test_resolve_now() {
        let space = Keyspace {
            now_ms: 42,
            ..Keyspace::default()
        };
        assert_eq!(space.resolve_now(STORE_TIME), 42);
        assert_eq!(space.resolve_now(7), 7);
    }

    #[tokio::test]
    async fn test_eval_counts_and_fails() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        let keys = vec!["counter".to_string()];

        assert_eq!(store.eval(&ECHO, &keys, &[2]).await.unwrap(), vec![2]);
        assert_eq!(store.eval(&ECHO, &keys, &[3]).await.unwrap(), vec![5]);
        assert_eq!(store.eval_count(), 2);

        store.fail_with("connection refused");
        assert!(matches!(
            store.eval(&ECHO, &keys, &[1]).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.eval_count(), 3);

        store.recover();
        assert_eq!(store.eval(&ECHO, &keys, &[1]).await.unwrap(), vec![6]);
        assert_eq!(store.get("counter").as_deref(), Some("6"));
    }

    #[test]
    fn test_snapshot_skips_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        {
            let mut space = store.space.lock();
            space.set_ex("short", 1, 1);
            space.set_ex("long", 2, 10);
        }
        assert_eq!(store.len(), 2);
        clock.advance(1_000);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("long").map(String::as_str), Some("2"));

        store.clear();
        assert!(store.is_empty());
    }
}
