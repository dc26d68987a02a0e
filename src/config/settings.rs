use dotenv::dotenv;
use std::{env, str::FromStr, time::Duration};

use chrono::Duration as ChronoDuration;

use crate::{
    config::engine::{EngineConfig, TimeframeRoles},
    services::strategies::common::Timeframe,
    utils::errors::ConfigError,
};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_port: u16,
    /// `demo` runs on the synthetic feed and a static payout rate
    pub app_mode: String,
    pub feed_url: Option<String>,
    pub payout_url: Option<String>,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenv().ok(); // loads `.env` file automatically
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key → value source; `new()` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let app_mode = vars.get("APP_MODE").unwrap_or_else(|| "demo".into()).to_lowercase();
        let settings = Self {
            server_port: vars.parsed("SERVER_PORT", 8080)?,
            app_mode,
            feed_url: vars.get("FEED_URL"),
            payout_url: vars.get("PAYOUT_URL"),
            telegram_token: vars.get("TELEGRAM_TOKEN"),
            telegram_chat_id: vars.get("TELEGRAM_CHAT_ID"),
            webhook_url: vars.get("WEBHOOK_URL"),
            webhook_secret: vars.get("WEBHOOK_SECRET"),
            engine: engine_from_vars(&vars)?,
        };

        if !settings.is_demo() && settings.feed_url.is_none() {
            return Err(ConfigError::Validation(
                "FEED_URL is required outside demo mode".into(),
            ));
        }
        if settings.telegram_token.is_some() != settings.telegram_chat_id.is_some() {
            return Err(ConfigError::Validation(
                "TELEGRAM_TOKEN and TELEGRAM_CHAT_ID must be set together".into(),
            ));
        }
        settings.engine.validate()?;
        Ok(settings)
    }

    pub fn is_demo(&self) -> bool {
        self.app_mode == "demo"
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn secs(&self, key: &'static str, default: ChronoDuration) -> Result<ChronoDuration, ConfigError> {
        let secs = self.parsed(key, default.num_seconds())?;
        ChronoDuration::try_seconds(secs).ok_or_else(|| ConfigError::Invalid {
            key,
            value: secs.to_string(),
        })
    }
}

fn engine_from_vars<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<EngineConfig, ConfigError> {
    let d = EngineConfig::default();

    let instruments = match vars.get("INSTRUMENTS") {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => d.instruments.clone(),
    };

    let timeframes = TimeframeRoles {
        htf: vars.parsed::<Timeframe>("HTF", d.timeframes.htf.clone())?,
        mtf: vars.parsed::<Timeframe>("MTF", d.timeframes.mtf.clone())?,
        ltf: vars.parsed::<Timeframe>("LTF", d.timeframes.ltf.clone())?,
    };

    let mut ind = d.indicators.clone();
    ind.rsi_period = vars.parsed("RSI_PERIOD", ind.rsi_period)?;
    ind.rsi_oversold = vars.parsed("RSI_OVERSOLD", ind.rsi_oversold)?;
    ind.rsi_overbought = vars.parsed("RSI_OVERBOUGHT", ind.rsi_overbought)?;
    ind.stoch_k = vars.parsed("STOCHASTIC_K", ind.stoch_k)?;
    ind.stoch_d = vars.parsed("STOCHASTIC_D", ind.stoch_d)?;
    ind.stoch_lower = vars.parsed("STOCHASTIC_LOWER", ind.stoch_lower)?;
    ind.stoch_upper = vars.parsed("STOCHASTIC_UPPER", ind.stoch_upper)?;
    ind.ema_len = vars.parsed("EMA_LEN", ind.ema_len)?;
    ind.atr_len = vars.parsed("ATR_LEN", ind.atr_len)?;
    ind.keltner_mult = vars.parsed("KC_MULT", ind.keltner_mult)?;
    ind.conflict_low = vars.parsed("RSI_CONFLICT_LOW", ind.conflict_low)?;
    ind.conflict_high = vars.parsed("RSI_CONFLICT_HIGH", ind.conflict_high)?;

    let mut breakout = d.breakout.clone();
    breakout.range_bars = vars.parsed("HTF_RANGE_BARS", breakout.range_bars)?;
    breakout.body_ratio = vars.parsed("BREAKOUT_BODY_RATIO", breakout.body_ratio)?;

    let mut gaps = d.gaps.clone();
    gaps.max_gaps = vars.parsed("MAX_GAPS", gaps.max_gaps)?;

    let mut zones = d.zones.clone();
    zones.swing_lookback = vars.parsed("SWING_LOOKBACK", zones.swing_lookback)?;
    zones.tolerance = vars.parsed("SR_TOLERANCE", zones.tolerance)?;
    zones.staleness_bars = vars.parsed("SR_STALENESS_BARS", zones.staleness_bars)?;
    zones.min_strength = vars.parsed("SR_MIN_STRENGTH", zones.min_strength)?;
    zones.weak_grace_bars = vars.parsed("SR_WEAK_GRACE_BARS", zones.weak_grace_bars)?;
    zones.strong_zone_strength = vars.parsed("SR_STRONG_STRENGTH", zones.strong_zone_strength)?;

    let mut el = d.eligibility.clone();
    el.min_payout_rate = vars.parsed("MIN_PAYOUT_RATE", el.min_payout_rate)?;
    el.min_profit_threshold = vars.parsed("MIN_PROFIT_THRESHOLD", el.min_profit_threshold)?;
    el.fallback_payout_rate = vars.parsed("FALLBACK_PAYOUT_RATE", el.fallback_payout_rate)?;
    el.payout_ttl = vars.secs("PAYOUT_TTL_SECS", el.payout_ttl)?;
    el.payout_expiry = match vars.get("PAYOUT_EXPIRY_SECS") {
        Some(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| ConfigError::Invalid {
            key: "PAYOUT_EXPIRY_SECS",
            value: raw,
        })?)),
        None => None,
    };

    let poll_secs: f64 = vars.parsed("POLL_INTERVAL_SECS", d.poll_interval.as_secs_f64())?;
    let poll_interval = Duration::try_from_secs_f64(poll_secs).map_err(|_| ConfigError::Invalid {
        key: "POLL_INTERVAL_SECS",
        value: poll_secs.to_string(),
    })?;

    Ok(EngineConfig {
        instruments,
        timeframes,
        candle_capacity: vars.parsed("CANDLES_N", d.candle_capacity)?,
        poll_interval,
        start_stagger: Duration::from_millis(vars.parsed("START_STAGGER_MS", d.start_stagger.as_millis() as u64)?),
        indicators: ind,
        breakout,
        gaps,
        zones,
        score_threshold: vars.parsed("MIN_SIGNAL_SCORE", d.score_threshold)?,
        eligibility: el,
        debounce_window: vars.secs("SIGNAL_DEBOUNCE_SECS", d.debounce_window)?,
        max_consecutive_errors: vars.parsed("MAX_CONSECUTIVE_ERRORS", d.max_consecutive_errors)?,
        error_cooldown: vars.secs("ERROR_COOLDOWN_SECS", d.error_cooldown)?,
    })
}
