//! Deny-list filter.
//!
//! By default a listed key is only reported; enforcement still decides. With
//! `mode: deny` a listed key is rejected before the store is consulted.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use super::{parse_params, FilterDecision, Plugin, PluginError};

pub(super) const TYPE: &str = "denylist";

/// What the deny-list does with a listed key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenyListMode {
    #[default]
    Log,
    Deny,
}

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(alias = "blacklist")]
    denylist: Vec<String>,
    #[serde(default)]
    mode: DenyListMode,
}

#[derive(Debug, Clone)]
pub struct DenyListPlugin {
    keys: HashSet<String>,
    mode: DenyListMode,
}

impl DenyListPlugin {
    pub fn new<I, S>(keys: I, mode: DenyListMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            mode,
        }
    }

    /// Build from `{"denylist": [..], "mode": "log" | "deny"}`.
    pub fn build(params: &serde_json::Value) -> Result<Arc<dyn Plugin>, PluginError> {
        let params: Params = parse_params(TYPE, params)?;
        Ok(Arc::new(Self::new(params.denylist, params.mode)))
    }
}

#[async_trait]
impl Plugin for DenyListPlugin {
    fn name(&self) -> &str {
        TYPE
    }

    async fn filter(&self, key: &str, tokens: u64) -> Result<FilterDecision, PluginError> {
        if !self.keys.contains(key) {
            return Ok(FilterDecision::Neutral);
        }

        warn!(key = %key, tokens = tokens, mode = ?self.mode, "Deny-listed key");
        match self.mode {
            DenyListMode::Log => Ok(FilterDecision::Neutral),
            DenyListMode::Deny => Ok(FilterDecision::Deny),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_mode_never_blocks() {
        let plugin = DenyListPlugin::build(&json!({ "denylist": ["blocked_user"] })).unwrap();
        assert_eq!(plugin.filter("blocked_user", 1).await.unwrap(), FilterDecision::Neutral);
        assert_eq!(plugin.filter("someone", 1).await.unwrap(), FilterDecision::Neutral);
    }

    #[tokio::test]
    async fn test_deny_mode_rejects_listed_keys() {
        let plugin = DenyListPlugin::new(["blocked_user"], DenyListMode::Deny);
        assert_eq!(plugin.filter("blocked_user", 1).await.unwrap(), FilterDecision::Deny);
        assert_eq!(plugin.filter("someone", 1).await.unwrap(), FilterDecision::Neutral);
    }

    #[test]
    fn test_build_parses_mode_and_legacy_key() {
        let plugin = DenyListPlugin::build(&json!({ "blacklist": ["x"], "mode": "deny" })).unwrap();
        let decision = tokio_test::block_on(plugin.filter("x", 1));
        assert_eq!(tokio_test::assert_ok!(decision), FilterDecision::Deny);

        assert!(DenyListPlugin::build(&json!({ "denylist": ["x"], "mode": "shun" })).is_err());
    }
}
