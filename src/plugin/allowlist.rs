//! Allow-list filter.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

use super::{parse_params, FilterDecision, Plugin, PluginError};

pub(super) const TYPE: &str = "allowlist";

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(alias = "whitelist")]
    allowlist: Vec<String>,
}

/// Lets listed keys bypass enforcement entirely.
#[derive(Debug, Clone)]
pub struct AllowListPlugin {
    keys: HashSet<String>,
}

impl AllowListPlugin {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from `{"allowlist": [..]}`.
    pub fn build(params: &serde_json::Value) -> Result<Arc<dyn Plugin>, PluginError> {
        let params: Params = parse_params(TYPE, params)?;
        Ok(Arc::new(Self::new(params.allowlist)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

#[async_trait]
impl Plugin for AllowListPlugin {
    fn name(&self) -> &str {
        TYPE
    }

    async fn filter(&self, key: &str, _tokens: u64) -> Result<FilterDecision, PluginError> {
        if self.contains(key) {
            trace!(key = %key, "Key is allow-listed");
            return Ok(FilterDecision::Bypass);
        }
        Ok(FilterDecision::Neutral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_listed_key_bypasses() {
        let plugin = AllowListPlugin::new(["user1", "user2"]);
        assert_eq!(plugin.filter("user1", 1).await.unwrap(), FilterDecision::Bypass);
        assert_eq!(plugin.filter("user3", 1).await.unwrap(), FilterDecision::Neutral);
    }

    #[tokio::test]
    async fn test_build_accepts_legacy_key() {
        let plugin = AllowListPlugin::build(&json!({ "whitelist": ["vip"] })).unwrap();
        assert_eq!(plugin.name(), "allowlist");
        assert_eq!(plugin.filter("vip", 3).await.unwrap(), FilterDecision::Bypass);
    }

    #[test]
    fn test_build_requires_list() {
        assert!(AllowListPlugin::build(&json!({})).is_err());
        assert!(AllowListPlugin::build(&json!({ "allowlist": [1, 2] })).is_err());
    }
}
