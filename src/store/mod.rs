//! Shared store abstraction.
//!
//! Every limiter decision is a single atomic script execution against the
//! store. A script is identified by a [`LimitScript`] that carries both its
//! Lua source, run by Redis, and a native twin run by [`MemoryStore`] under a
//! single lock. Both follow the same key/argument layout and reply shape.

pub mod memory;
pub mod redis;

pub use self::memory::{Keyspace, MemoryStore};
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Argument value telling a script to read the store server's clock.
pub const STORE_TIME: i64 = -1;

/// Errors raised by a store round trip.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        ::redis::RedisError,
    ),
    #[error("Store call exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("Script error: {0}")]
    Script(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Native body of a script, executed atomically by [`MemoryStore`].
pub type NativeScript = fn(&mut Keyspace, &[String], &[i64]) -> Result<Vec<i64>, StoreError>;

/// A server-side script with a native equivalent.
#[derive(Debug)]
pub struct LimitScript {
    name: &'static str,
    source: &'static str,
    native: NativeScript,
}

impl LimitScript {
    pub const fn new(name: &'static str, source: &'static str, native: NativeScript) -> Self {
        Self {
            name,
            source,
            native,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua source executed by Redis.
    pub fn source(&self) -> &'static str {
        self.source
    }

    pub(crate) fn run_native(
        &self,
        space: &mut Keyspace,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        (self.native)(space, keys, args)
    }
}

/// A key-value store able to run one atomic script per call.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Execute `script` atomically with positional keys and arguments.
    async fn eval(
        &self,
        script: &LimitScript,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError>;
}

/// Decoded reply shared by every limiter script: `{allowed, remaining, retry_after_ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub remaining: i64,
    pub retry_after_ms: i64,
}

impl ScriptReply {
    pub fn from_values(values: &[i64]) -> Result<Self, StoreError> {
        match values {
            [allowed, remaining, retry_after_ms, ..] => Ok(Self {
                allowed: *allowed == 1,
                remaining: *remaining,
                retry_after_ms: *retry_after_ms,
            }),
            other => Err(StoreError::Script(format!(
                "expected 3 reply values, got {}",
                other.len()
            ))),
        }
    }

    pub fn into_values(self) -> Vec<i64> {
        vec![self.allowed as i64, self.remaining, self.retry_after_ms]
    }
}

/// Fetch a positional key, failing like Redis would on a short KEYS table.
pub(crate) fn key_at(keys: &[String], index: usize) -> Result<&str, StoreError> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Script(format!("missing KEYS[{}]", index + 1)))
}

/// Fetch a positional argument.
pub(crate) fn arg_at(args: &[i64], index: usize) -> Result<i64, StoreError> {
    args.get(index)
        .copied()
        .ok_or_else(|| StoreError::Script(format!("missing ARGV[{}]", index + 1)))
}
