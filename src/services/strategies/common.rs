// src/services/strategies/common.rs
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts:     DateTime<Utc>,
    pub open:   f64,
    pub high:   f64,
    pub low:    f64,
    pub close:  f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    /// High-low span of the bar.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }
}

/// Trade direction of a candidate / signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// +1 for long, -1 for short; multiplies factor weights.
    pub fn sign(&self) -> i32 {
        match self {
            Direction::Buy => 1,
            Direction::Sell => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a candle interval plays in the multi-timeframe read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TimeframeRole {
    /// trend / breakout context
    Htf,
    /// main signal timeframe
    Mtf,
    /// entry timing + current price
    Ltf,
}

impl TimeframeRole {
    pub fn label(&self) -> &'static str {
        match self {
            TimeframeRole::Htf => "HTF",
            TimeframeRole::Mtf => "MTF",
            TimeframeRole::Ltf => "LTF",
        }
    }
}

// --- Timeframe -------------------------------------------------------

static TIMEFRAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([smhd])$").expect("timeframe regex"));

/// A candle interval such as `30s`, `5m`, `1h`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Timeframe {
    secs: u64,
    label: String,
}

impl Timeframe {
    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let caps = TIMEFRAME_RE
            .captures(&raw)
            .ok_or_else(|| ConfigError::InvalidTimeframe(s.to_string()))?;

        let n: u64 = caps[1]
            .parse()
            .map_err(|_| ConfigError::InvalidTimeframe(s.to_string()))?;
        let unit = match &caps[2] {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            _ => 86_400,
        };
        let secs = n
            .checked_mul(unit)
            .filter(|&secs| secs > 0 && i64::try_from(secs).is_ok())
            .ok_or_else(|| ConfigError::InvalidTimeframe(s.to_string()))?;

        Ok(Self { secs, label: raw })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
