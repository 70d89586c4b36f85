//! Limiter configuration types.
//!
//! These types describe a single logical limiter: which algorithm to run,
//! how fast callers may go, how keys are partitioned and which filters run
//! before enforcement. They derive `serde` so a host application can embed
//! them in whatever configuration format it already loads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// Rate limiting algorithm backing a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterType {
    /// Fixed counter reset by the store's own key expiry
    Counter,
    /// Weighted blend of the current and previous fixed windows
    SlidingWindow,
    /// Continuously refilled bucket of tokens
    TokenBucket,
    /// Queue drained at a constant rate
    LeakyBucket,
}

impl LimiterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterType::Counter => "counter",
            LimiterType::SlidingWindow => "sliding_window",
            LimiterType::TokenBucket => "token_bucket",
            LimiterType::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for LimiterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterType {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "counter" => Ok(LimiterType::Counter),
            "sliding_window" => Ok(LimiterType::SlidingWindow),
            "token_bucket" => Ok(LimiterType::TokenBucket),
            "leaky_bucket" => Ok(LimiterType::LeakyBucket),
            other => Err(FloodgateError::Config(format!(
                "unsupported limiter type: {other}"
            ))),
        }
    }
}

/// Time unit the maximum rate is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    #[serde(rename = "s", alias = "second")]
    Second,
    #[serde(rename = "m", alias = "minute")]
    Minute,
    #[serde(rename = "h", alias = "hour")]
    Hour,
    #[serde(rename = "d", alias = "day")]
    Day,
}

impl TimeUnit {
    /// Get the duration of one window of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Window length in milliseconds, the resolution every script works in.
    pub fn window_ms(&self) -> i64 {
        self.duration().as_millis() as i64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Second => "s",
            TimeUnit::Minute => "m",
            TimeUnit::Hour => "h",
            TimeUnit::Day => "d",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" | "second" => Ok(TimeUnit::Second),
            "m" | "minute" => Ok(TimeUnit::Minute),
            "h" | "hour" => Ok(TimeUnit::Hour),
            "d" | "day" => Ok(TimeUnit::Day),
            other => Err(FloodgateError::Config(format!("unsupported time unit: {other}"))),
        }
    }
}

/// Axis along which limits are partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Global,
    User,
    Ip,
    Api,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::User => "user",
            Dimension::Ip => "ip",
            Dimension::Api => "api",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Dimension::Global),
            "user" => Ok(Dimension::User),
            "ip" => Ok(Dimension::Ip),
            "api" => Ok(Dimension::Api),
            other => Err(FloodgateError::Config(format!("unsupported dimension: {other}"))),
        }
    }
}

/// Where scripts take "now" from.
///
/// `Client` passes the calling process's clock into every script and assumes
/// all replicas are NTP-synchronized. `Store` makes the script read the store
/// server's own clock, so every replica shares one time source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    #[default]
    Client,
    Store,
}

/// Configuration for a single plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Registry key of the plugin factory
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Untyped parameters, validated by the plugin constructor
    #[serde(default)]
    pub params: serde_json::Value,
}

impl PluginConfig {
    pub fn new(plugin_type: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            params,
        }
    }
}

/// Configuration for one logical limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Algorithm backing the limiter
    #[serde(rename = "type")]
    pub limiter_type: LimiterType,

    /// Prefix of every store key owned by this limiter
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Maximum rate per time unit (must be positive)
    pub max_rate: u64,

    /// Time unit of `max_rate`
    #[serde(default = "default_time_unit")]
    pub time_unit: TimeUnit,

    /// Partitioning axis used when building keys
    #[serde(default = "default_dimension")]
    pub dimension: Dimension,

    /// Expiry of store records in seconds; 0 selects two windows
    #[serde(default)]
    pub expire_time: u64,

    /// Plugins to attach, in evaluation order
    #[serde(default)]
    pub plugin_configs: Vec<PluginConfig>,

    /// Native plugin libraries; not supported and skipped with a warning
    #[serde(default)]
    pub dynamic_plugin_paths: Vec<PathBuf>,

    /// Source of the timestamp handed to scripts
    #[serde(default)]
    pub clock_source: ClockSource,

    /// Deadline for a single store round trip in milliseconds
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limiter_type: LimiterType::Counter,
            key_prefix: default_key_prefix(),
            max_rate: default_max_rate(),
            time_unit: default_time_unit(),
            dimension: default_dimension(),
            expire_time: 0,
            plugin_configs: Vec::new(),
            dynamic_plugin_paths: Vec::new(),
            clock_source: ClockSource::default(),
            store_timeout_ms: None,
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_max_rate() -> u64 {
    100
}

fn default_time_unit() -> TimeUnit {
    TimeUnit::Second
}

fn default_dimension() -> Dimension {
    Dimension::Global
}

impl LimiterConfig {
    /// Create a configuration for the given algorithm and rate.
    pub fn new(limiter_type: LimiterType, max_rate: u64, time_unit: TimeUnit) -> Self {
        Self {
            limiter_type,
            max_rate,
            time_unit,
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_expire_time(mut self, seconds: u64) -> Self {
        self.expire_time = seconds;
        self
    }

    pub fn with_plugin(mut self, plugin: PluginConfig) -> Self {
        self.plugin_configs.push(plugin);
        self
    }

    pub fn with_clock_source(mut self, source: ClockSource) -> Self {
        self.clock_source = source;
        self
    }

    /// Check the numeric invariants a limiter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_rate == 0 {
            return Err(FloodgateError::Config(
                "max_rate must be greater than zero".to_string(),
            ));
        }
        if self.max_rate > i64::MAX as u64 {
            return Err(FloodgateError::Config(format!(
                "max_rate {} exceeds the supported range",
                self.max_rate
            )));
        }
        let window_secs = self.time_unit.duration().as_secs();
        if self.expire_time != 0 && self.expire_time < window_secs {
            return Err(FloodgateError::Config(format!(
                "expire_time {}s is shorter than one {}s window",
                self.expire_time, window_secs
            )));
        }
        if self.store_timeout_ms == Some(0) {
            return Err(FloodgateError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Expiry applied to store records, in seconds.
    pub fn effective_expire_secs(&self) -> u64 {
        if self.expire_time == 0 {
            self.time_unit.duration().as_secs() * 2
        } else {
            self.expire_time
        }
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }
}
