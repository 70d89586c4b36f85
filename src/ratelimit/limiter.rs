//! Limiter contract, plugin set, and the enforcement flow shared by every
//! algorithm.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::key::resolve_key;
use crate::clock::Clock;
use crate::config::{ClockSource, LimiterConfig, LimiterType};
use crate::error::Result;
use crate::plugin::{FilterDecision, Plugin};
use crate::store::{LimitScript, ScriptReply, ScriptStore, StoreError, STORE_TIME};

/// Outcome of a single `allow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Capacity left after this call, within `[0, max_rate]`
    pub remaining: u64,
    /// Milliseconds to wait before retrying; zero iff allowed
    pub retry_after_ms: u64,
}

impl RateLimitResult {
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub fn denied(remaining: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after_ms: retry_after_ms.max(1),
        }
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

/// A configured rate limiter.
///
/// Implementations are long-lived and shared between tasks; all state that
/// matters for a decision lives in the store.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether `tokens` units for `key` may proceed.
    ///
    /// Store failures never surface here: the call fails open and reports
    /// full capacity.
    async fn allow(&self, key: &str, tokens: u64) -> Result<RateLimitResult>;

    fn limiter_type(&self) -> LimiterType;

    /// The plugin set consulted before enforcement.
    fn base(&self) -> &BaseLimiter;

    fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.base().register_plugin(plugin);
    }

    fn remove_plugin(&self, name: &str) -> bool {
        self.base().remove_plugin(name)
    }

    fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.base().plugins()
    }
}

/// The plugins attached to one limiter.
///
/// Readers clone an immutable snapshot, so a registration racing with
/// `run_plugins` never exposes a half-updated set.
#[derive(Default)]
pub struct BaseLimiter {
    plugins: RwLock<Arc<Vec<Arc<dyn Plugin>>>>,
}

impl BaseLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `plugin`, replacing any plugin with the same name in place.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut guard = self.plugins.write();
        let mut next: Vec<Arc<dyn Plugin>> = guard.as_ref().clone();
        match next.iter().position(|p| p.name() == plugin.name()) {
            Some(index) => next[index] = plugin.clone(),
            None => next.push(plugin.clone()),
        }
        *guard = Arc::new(next);
        info!(plugin = plugin.name(), "Plugin registered");
    }

    /// Remove the plugin called `name`. Returns whether one was removed.
    pub fn remove_plugin(&self, name: &str) -> bool {
        let mut guard = self.plugins.write();
        if !guard.iter().any(|p| p.name() == name) {
            return false;
        }
        let next: Vec<Arc<dyn Plugin>> = guard
            .iter()
            .filter(|p| p.name() != name)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        info!(plugin = name, "Plugin removed");
        true
    }

    /// Snapshot of the registered plugins in evaluation order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().as_ref().clone()
    }

    /// Run plugins in registration order until one has an opinion.
    ///
    /// A failing plugin is logged and treated as neutral.
    pub async fn run_plugins(&self, key: &str, tokens: u64) -> FilterDecision {
        let snapshot = self.plugins.read().clone();
        for plugin in snapshot.iter() {
            match plugin.filter(key, tokens).await {
                Ok(FilterDecision::Neutral) => continue,
                Ok(decision) => {
                    debug!(plugin = plugin.name(), key = %key, decision = ?decision, "Plugin decided request");
                    return decision;
                }
                Err(e) => {
                    error!(plugin = plugin.name(), key = %key, error = %e, "Plugin failed");
                }
            }
        }
        FilterDecision::Neutral
    }
}

/// Token count as a script argument.
pub(crate) fn tokens_arg(tokens: u64) -> i64 {
    tokens.min(i64::MAX as u64) as i64
}

/// State and flow shared by the four algorithm implementations.
pub(crate) struct LimiterCore {
    pub(crate) base: BaseLimiter,
    pub(crate) config: LimiterConfig,
    store: Arc<dyn ScriptStore>,
    clock: Arc<dyn Clock>,
}

impl LimiterCore {
    pub(crate) fn new(config: LimiterConfig, store: Arc<dyn ScriptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base: BaseLimiter::new(),
            config,
            store,
            clock,
        }
    }

    pub(crate) fn max_rate(&self) -> u64 {
        self.config.max_rate
    }

    pub(crate) fn window_ms(&self) -> i64 {
        self.config.time_unit.window_ms()
    }

    pub(crate) fn expire_secs(&self) -> i64 {
        self.config.effective_expire_secs() as i64
    }

    /// Timestamp argument handed to scripts.
    pub(crate) fn now_arg(&self) -> i64 {
        match self.config.clock_source {
            ClockSource::Client => self.clock.now_ms(),
            ClockSource::Store => STORE_TIME,
        }
    }

    fn fail_open(&self) -> RateLimitResult {
        RateLimitResult::allowed(self.max_rate())
    }

    /// Run plugins, then one script execution, and shape the reply.
    ///
    /// `invocation` maps the resolved store key to the script's keys and
    /// arguments.
    pub(crate) async fn enforce<F>(
        &self,
        script: &LimitScript,
        key: &str,
        tokens: u64,
        invocation: F,
    ) -> Result<RateLimitResult>
    where
        F: FnOnce(&str) -> (Vec<String>, Vec<i64>) + Send,
    {
        match self.base.run_plugins(key, tokens).await {
            FilterDecision::Bypass => return Ok(RateLimitResult::allowed(self.max_rate())),
            FilterDecision::Deny => return Ok(RateLimitResult::denied(0, self.window_ms() as u64)),
            FilterDecision::Neutral => {}
        }

        let limiter_key = resolve_key(&self.config.key_prefix, self.config.dimension, key);
        let (keys, args) = invocation(&limiter_key);

        let reply = match self.eval(script, &keys, &args).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    limiter = %self.config.limiter_type,
                    key = %limiter_key,
                    error = %e,
                    "Store call failed, allowing request"
                );
                return Ok(self.fail_open());
            }
        };

        let remaining = reply.remaining.clamp(0, self.max_rate() as i64) as u64;
        let result = if reply.allowed {
            RateLimitResult::allowed(remaining)
        } else {
            RateLimitResult::denied(remaining, reply.retry_after_ms.max(0) as u64)
        };

        trace!(
            limiter = %self.config.limiter_type,
            key = %limiter_key,
            tokens = tokens,
            allowed = result.allowed,
            remaining = result.remaining,
            "Rate limit decision"
        );
        Ok(result)
    }

    async fn eval(
        &self,
        script: &LimitScript,
        keys: &[String],
        args: &[i64],
    ) -> std::result::Result<ScriptReply, StoreError> {
        let call = self.store.eval(script, keys, args);
        let values = match self.config.store_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))??,
            None => call.await?,
        };
        ScriptReply::from_values(&values)
    }
}
