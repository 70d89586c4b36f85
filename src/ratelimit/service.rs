//! Limiter factory.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::counter::FixedCounterLimiter;
use super::leaky_bucket::LeakyBucketLimiter;
use super::limiter::RateLimiter;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterConfig, LimiterType};
use crate::error::Result;
use crate::plugin::PluginRegistry;
use crate::store::ScriptStore;

/// Builds configured limiters over one shared store and plugin registry.
pub struct LimiterService {
    store: Arc<dyn ScriptStore>,
    registry: Arc<PluginRegistry>,
    clock: Arc<dyn Clock>,
}

impl LimiterService {
    /// Create a service using the system clock.
    pub fn new(store: Arc<dyn ScriptStore>, registry: Arc<PluginRegistry>) -> Self {
        Self::with_clock(store, registry, Arc::new(SystemClock))
    }

    /// Create a service whose limiters read time from `clock`.
    pub fn with_clock(
        store: Arc<dyn ScriptStore>,
        registry: Arc<PluginRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Validate `config` and build the limiter it describes, with its
    /// configured plugins attached in order.
    ///
    /// A plugin that cannot be built is logged and left out; the limiter is
    /// still returned.
    #[instrument(
        skip(self, config),
        fields(limiter = %config.limiter_type, prefix = %config.key_prefix)
    )]
    pub fn create_limiter(&self, config: LimiterConfig) -> Result<Arc<dyn RateLimiter>> {
        config.validate()?;

        let plugin_configs = config.plugin_configs.clone();
        let dynamic_paths = config.dynamic_plugin_paths.clone();
        let (limiter_type, max_rate, time_unit) =
            (config.limiter_type, config.max_rate, config.time_unit);

        let store = self.store.clone();
        let clock = self.clock.clone();
        let limiter: Arc<dyn RateLimiter> = match limiter_type {
            LimiterType::Counter => Arc::new(FixedCounterLimiter::new(config, store, clock)),
            LimiterType::SlidingWindow => Arc::new(SlidingWindowLimiter::new(config, store, clock)),
            LimiterType::TokenBucket => Arc::new(TokenBucketLimiter::new(config, store, clock)),
            LimiterType::LeakyBucket => Arc::new(LeakyBucketLimiter::new(config, store, clock)),
        };

        for plugin_config in &plugin_configs {
            match self.registry.create(plugin_config) {
                Ok(plugin) => limiter.register_plugin(plugin),
                Err(e) => {
                    error!(
                        plugin_type = %plugin_config.plugin_type,
                        error = %e,
                        "Failed to create plugin, skipping"
                    );
                }
            }
        }

        for path in &dynamic_paths {
            warn!(path = %path.display(), "Dynamic plugin loading is not supported, skipping");
        }

        info!(
            max_rate = max_rate,
            time_unit = time_unit.as_str(),
            plugins = limiter.plugins().len(),
            "Rate limiter created"
        );
        Ok(limiter)
    }
}
