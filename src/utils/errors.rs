// src/utils/errors.rs

use chrono::{DateTime, Utc};

/// Market-data collaborator failures. Always transient from the engine's view.
#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed returned status {0}")]
    Status(u16),
    #[error("malformed candle: {0}")]
    Malformed(String),
}

/// Candle-buffer integrity violations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("out-of-order candle at {candle} (latest stored {latest})")]
    OutOfOrderCandle {
        candle: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
}

/// Payout-rate lookup failures; the caller substitutes a fallback.
#[derive(thiserror::Error, Debug)]
pub enum PayoutError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payout service returned status {0}")]
    Status(u16),
    #[error("payout rate {0} outside [0, 1]")]
    OutOfRange(f64),
}

/// Notification-sink failures. Logged, never retried.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink returned status {0}")]
    Status(u16),
    #[error("serialise signal: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that end one instrument cycle early and count toward its cooldown.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("feed unavailable for {timeframe}: {source}")]
    FeedUnavailable {
        timeframe: String,
        #[source]
        source: FeedError,
    },
}

/// Startup-only configuration problems.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("invalid timeframe '{0}'")]
    InvalidTimeframe(String),
    #[error("{0}")]
    Validation(String),
}
