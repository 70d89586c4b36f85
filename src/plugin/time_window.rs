//! Time-of-day filter.
//!
//! Requests arriving inside any configured local-time window bypass
//! enforcement, e.g. to lift limits during a nightly batch slot.

use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use super::{parse_params, FilterDecision, Plugin, PluginError};

pub(super) const TYPE: &str = "time_window";

const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Deserialize)]
struct RawRange {
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(alias = "time_ranges")]
    windows: Vec<RawRange>,
}

/// A daily window with minute resolution.
///
/// `start` is inclusive and `end` exclusive. A window whose end is before its
/// start crosses midnight; equal bounds cover the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: truncate_to_minute(start),
            end: truncate_to_minute(end),
        }
    }

    /// Parse `"HH:MM"` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self, PluginError> {
        Ok(Self::new(parse_time(start)?, parse_time(end)?))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        let time = truncate_to_minute(time);
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(TIME_FORMAT),
            self.end.format(TIME_FORMAT)
        )
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, PluginError> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).map_err(|e| PluginError::InvalidValue {
        plugin: TYPE.to_string(),
        reason: format!("bad time {value:?}: {e}"),
    })
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

type TimeSource = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

/// Bypasses enforcement while the local time falls in one of its windows.
#[derive(Clone)]
pub struct TimeWindowPlugin {
    windows: Vec<TimeRange>,
    now: TimeSource,
}

impl TimeWindowPlugin {
    pub fn new(windows: Vec<TimeRange>) -> Self {
        Self {
            windows,
            now: Arc::new(|| Local::now().time()),
        }
    }

    /// Replace the wall clock, e.g. to pin the time of day.
    pub fn with_time_source(mut self, now: impl Fn() -> NaiveTime + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    /// Build from `{"windows": [{"start": "HH:MM", "end": "HH:MM"}, ..]}`.
    pub fn build(params: &serde_json::Value) -> Result<Arc<dyn Plugin>, PluginError> {
        let params: Params = parse_params(TYPE, params)?;
        let windows = params
            .windows
            .iter()
            .map(|w| TimeRange::parse(&w.start, &w.end))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Self::new(windows)))
    }

    pub fn windows(&self) -> &[TimeRange] {
        &self.windows
    }

    /// Whether `time` falls inside any window.
    pub fn is_open(&self, time: NaiveTime) -> bool {
        self.windows.iter().any(|w| w.contains(time))
    }
}

impl fmt::Debug for TimeWindowPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWindowPlugin")
            .field("windows", &self.windows)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Plugin for TimeWindowPlugin {
    fn name(&self) -> &str {
        TYPE
    }

    async fn filter(&self, key: &str, _tokens: u64) -> Result<FilterDecision, PluginError> {
        let now = (self.now)();
        if self.is_open(now) {
            trace!(key = %key, time = %now.format(TIME_FORMAT), "Inside bypass window");
            return Ok(FilterDecision::Bypass);
        }
        Ok(FilterDecision::Neutral)
    }
}
