//! Filter plugins run before a limiter touches the store.
//!
//! A plugin inspects the key and token count of a request and answers with a
//! [`FilterDecision`]. Plugins are built by name through a [`PluginRegistry`],
//! which a host constructs once and hands to the
//! [`LimiterService`](crate::ratelimit::LimiterService).

mod allowlist;
mod denylist;
mod time_window;

pub use allowlist::AllowListPlugin;
pub use denylist::{DenyListMode, DenyListPlugin};
pub use time_window::{TimeRange, TimeWindowPlugin};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::PluginConfig;

/// Errors raised while building or running a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unregistered plugin type: {0}")]
    UnknownType(String),
    #[error("invalid parameters for plugin {plugin}: {source}")]
    InvalidParams {
        plugin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid parameters for plugin {plugin}: {reason}")]
    InvalidValue { plugin: String, reason: String },
    #[error("filter failed: {0}")]
    Filter(String),
}

/// Outcome of running one plugin against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Skip enforcement and admit the request
    Bypass,
    /// Reject the request without consulting the store
    Deny,
    /// No opinion; continue with the next plugin
    Neutral,
}

/// A request filter attached to a limiter.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name of this plugin within a limiter.
    fn name(&self) -> &str;

    /// Decide whether the request identified by `key` should bypass, be
    /// denied, or go on to enforcement.
    async fn filter(&self, key: &str, tokens: u64) -> Result<FilterDecision, PluginError>;
}

/// Constructor for a plugin type.
pub type PluginFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

/// Name-keyed registry of plugin constructors.
///
/// Built-in filters are registered by [`PluginRegistry::with_builtins`];
/// applications add their own with [`PluginRegistry::register_factory`].
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the allow-list, deny-list and time-window
    /// filters, each also reachable under its legacy name.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_factory(allowlist::TYPE, Arc::new(AllowListPlugin::build));
        registry.register_factory("whitelist", Arc::new(AllowListPlugin::build));
        registry.register_factory(denylist::TYPE, Arc::new(DenyListPlugin::build));
        registry.register_factory("blacklist", Arc::new(DenyListPlugin::build));
        registry.register_factory(time_window::TYPE, Arc::new(TimeWindowPlugin::build));
        registry.register_factory("time_based", Arc::new(TimeWindowPlugin::build));
        registry
    }

    /// Register `factory` under `plugin_type`, replacing any previous one.
    pub fn register_factory(&self, plugin_type: impl Into<String>, factory: PluginFactory) {
        let plugin_type = plugin_type.into();
        debug!(plugin_type = %plugin_type, "Registering plugin factory");
        self.factories.write().insert(plugin_type, factory);
    }

    pub fn contains(&self, plugin_type: &str) -> bool {
        self.factories.read().contains_key(plugin_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Build the plugin described by `config`.
    pub fn create(&self, config: &PluginConfig) -> Result<Arc<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .read()
            .get(&config.plugin_type)
            .cloned()
            .ok_or_else(|| PluginError::UnknownType(config.plugin_type.clone()))?;
        factory(&config.params)
    }
}

/// Deserialize untyped plugin params into the plugin's own parameter type.
pub(crate) fn parse_params<T: DeserializeOwned>(
    plugin: &str,
    params: &serde_json::Value,
) -> Result<T, PluginError> {
    serde_json::from_value(params.clone()).map_err(|source| PluginError::InvalidParams {
        plugin: plugin.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(FilterDecision);

    #[async_trait]
    impl Plugin for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn filter(&self, _key: &str, _tokens: u64) -> Result<FilterDecision, PluginError> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = PluginRegistry::with_builtins();
        for name in ["allowlist", "whitelist", "denylist", "blacklist", "time_window", "time_based"] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert_eq!(registry.types().len(), 6);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let registry = PluginRegistry::with_builtins();
        let result = registry.create(&PluginConfig::new("geo_fence", json!({})));
        assert!(matches!(result, Err(PluginError::UnknownType(t)) if t == "geo_fence"));
    }

    #[test]
    fn test_malformed_params_are_an_error() {
        let registry = PluginRegistry::with_builtins();
        let result = registry.create(&PluginConfig::new("allowlist", json!({ "allowlist": 5 })));
        assert!(matches!(result, Err(PluginError::InvalidParams { .. })));
    }

    #[tokio::test]
    async fn test_custom_factory_replaces_previous() {
        let registry = PluginRegistry::new();
        registry.register_factory(
            "fixed",
            Arc::new(|_: &serde_json::Value| Ok(Arc::new(Fixed(FilterDecision::Neutral)) as Arc<dyn Plugin>)),
        );
        registry.register_factory(
            "fixed",
            Arc::new(|_: &serde_json::Value| Ok(Arc::new(Fixed(FilterDecision::Bypass)) as Arc<dyn Plugin>)),
        );

        let plugin = registry.create(&PluginConfig::new("fixed", json!(null))).unwrap();
        assert_eq!(plugin.filter("k", 1).await.unwrap(), FilterDecision::Bypass);
    }
}
