//! Typed engine configuration. Built once at startup (see
//! [`Settings::new`](crate::config::settings::Settings::new)), validated,
//! then shared read-only behind an `Arc` for the process lifetime.

use std::{str::FromStr, time::Duration};

use chrono::Duration as ChronoDuration;

use crate::{
    services::strategies::common::{Timeframe, TimeframeRole},
    utils::errors::ConfigError,
};

/// Which candle interval fills each analysis role.
#[derive(Debug, Clone)]
pub struct TimeframeRoles {
    pub htf: Timeframe,
    pub mtf: Timeframe,
    pub ltf: Timeframe,
}

impl TimeframeRoles {
    pub fn get(&self, role: TimeframeRole) -> &Timeframe {
        match role {
            TimeframeRole::Htf => &self.htf,
            TimeframeRole::Mtf => &self.mtf,
            TimeframeRole::Ltf => &self.ltf,
        }
    }

    /// Distinct intervals to fetch, shortest first.
    pub fn distinct(&self) -> Vec<Timeframe> {
        let mut tfs = vec![self.htf.clone(), self.mtf.clone(), self.ltf.clone()];
        tfs.sort();
        tfs.dedup();
        tfs
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub stoch_k: usize,
    pub stoch_d: usize,
    pub stoch_lower: f64,
    pub stoch_upper: f64,
    pub ema_len: usize,
    pub atr_len: usize,
    pub keltner_mult: f64,
    /// HTF/MTF RSI bands for the momentum-conflict penalty: one side below
    /// `conflict_low` while the other is above `conflict_high`
    pub conflict_low: f64,
    pub conflict_high: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            stoch_k: 14,
            stoch_d: 3,
            stoch_lower: 20.0,
            stoch_upper: 80.0,
            ema_len: 20,
            atr_len: 10,
            keltner_mult: 1.5,
            conflict_low: 40.0,
            conflict_high: 60.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakoutParams {
    /// bars forming the prior range (current bar excluded)
    pub range_bars: usize,
    /// minimum |close-open| / (high-low), strictly exceeded
    pub body_ratio: f64,
}

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            range_bars: 20,
            body_ratio: 0.35,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GapParams {
    pub max_gaps: usize,
}

impl Default for GapParams {
    fn default() -> Self {
        Self { max_gaps: 50 }
    }
}

/// Distance within which a swing level joins an existing zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneTolerance {
    Absolute(f64),
    /// fraction of the level, `0.003` = 0.3 %
    Percent(f64),
}

impl ZoneTolerance {
    pub fn band(&self, level: f64) -> f64 {
        match *self {
            ZoneTolerance::Absolute(v) => v,
            ZoneTolerance::Percent(p) => level.abs() * p,
        }
    }
}

impl FromStr for ZoneTolerance {
    type Err = ConfigError;

    /// `"0.003"` → absolute, `"0.3%"` → percent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let bad = || ConfigError::Invalid {
            key: "SR_TOLERANCE",
            value: s.to_string(),
        };
        let tol = match raw.strip_suffix('%') {
            Some(pct) => ZoneTolerance::Percent(pct.trim().parse::<f64>().map_err(|_| bad())? / 100.0),
            None => ZoneTolerance::Absolute(raw.parse::<f64>().map_err(|_| bad())?),
        };
        match tol {
            ZoneTolerance::Absolute(v) | ZoneTolerance::Percent(v) if v > 0.0 && v.is_finite() => Ok(tol),
            _ => Err(bad()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZoneParams {
    /// symmetric swing lookback `L`
    pub swing_lookback: usize,
    pub tolerance: ZoneTolerance,
    /// bars since last touch after which a zone is dropped
    pub staleness_bars: u64,
    pub min_strength: u32,
    /// weak zones survive this many bars before the strength floor applies
    pub weak_grace_bars: u64,
    /// strength at which a zone starts contributing to the score
    pub strong_zone_strength: u32,
}

impl Default for ZoneParams {
    fn default() -> Self {
        Self {
            swing_lookback: 3,
            tolerance: ZoneTolerance::Absolute(0.003),
            staleness_bars: 150,
            min_strength: 2,
            weak_grace_bars: 50,
            strong_zone_strength: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EligibilityParams {
    pub min_payout_rate: f64,
    pub min_profit_threshold: f64,
    pub fallback_payout_rate: f64,
    pub payout_ttl: ChronoDuration,
    /// option expiry passed to the payout lookup
    pub payout_expiry: Option<Duration>,
}

impl Default for EligibilityParams {
    fn default() -> Self {
        Self {
            min_payout_rate: 0.75,
            min_profit_threshold: 0.40,
            fallback_payout_rate: 0.80,
            payout_ttl: ChronoDuration::hours(1),
            payout_expiry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub instruments: Vec<String>,
    pub timeframes: TimeframeRoles,
    pub candle_capacity: usize,
    pub poll_interval: Duration,
    /// delay between worker start-ups, spreads feed load
    pub start_stagger: Duration,
    pub indicators: IndicatorParams,
    pub breakout: BreakoutParams,
    pub gaps: GapParams,
    pub zones: ZoneParams,
    /// |score| needed for a candidate; BUY at >= +t, SELL at <= -t
    pub score_threshold: i32,
    pub eligibility: EligibilityParams,
    pub debounce_window: ChronoDuration,
    pub max_consecutive_errors: u32,
    pub error_cooldown: ChronoDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tf = |s: &str| s.parse::<Timeframe>().expect("built-in timeframe");
        Self {
            instruments: vec!["EURUSD-OTC".into(), "GBPUSD-OTC".into()],
            timeframes: TimeframeRoles {
                htf: tf("15m"),
                mtf: tf("5m"),
                ltf: tf("1m"),
            },
            candle_capacity: 200,
            poll_interval: Duration::from_secs(30),
            start_stagger: Duration::from_millis(200),
            indicators: IndicatorParams::default(),
            breakout: BreakoutParams::default(),
            gaps: GapParams::default(),
            zones: ZoneParams::default(),
            score_threshold: 60,
            eligibility: EligibilityParams::default(),
            debounce_window: ChronoDuration::minutes(30),
            max_consecutive_errors: 5,
            error_cooldown: ChronoDuration::minutes(5),
        }
    }
}

impl EngineConfig {
    /// Rejects configurations the engine cannot run sensibly with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));

        if self.instruments.is_empty() {
            return fail("at least one instrument is required".into());
        }
        if self.instruments.iter().any(|i| i.trim().is_empty()) {
            return fail("instrument names must not be blank".into());
        }
        if self.poll_interval.is_zero() {
            return fail("poll interval must be positive".into());
        }

        let ind = &self.indicators;
        if ind.rsi_period == 0 || ind.stoch_k == 0 || ind.stoch_d == 0 || ind.ema_len == 0 || ind.atr_len == 0 {
            return fail("indicator periods must be positive".into());
        }
        if !(0.0..=100.0).contains(&ind.rsi_oversold)
            || !(0.0..=100.0).contains(&ind.rsi_overbought)
            || ind.rsi_oversold >= ind.rsi_overbought
        {
            return fail(format!(
                "RSI bands {}/{} must satisfy 0 <= oversold < overbought <= 100",
                ind.rsi_oversold, ind.rsi_overbought
            ));
        }
        for (name, v) in [
            ("RSI oversold", ind.rsi_oversold),
            ("RSI overbought", ind.rsi_overbought),
            ("stochastic lower", ind.stoch_lower),
            ("stochastic upper", ind.stoch_upper),
            ("Keltner multiplier", ind.keltner_mult),
            ("conflict low", ind.conflict_low),
            ("conflict high", ind.conflict_high),
        ] {
            if !v.is_finite() {
                return fail(format!("{name} must be a finite number, got {v}"));
            }
        }
        if !(0.0..=100.0).contains(&ind.conflict_low)
            || !(0.0..=100.0).contains(&ind.conflict_high)
            || ind.conflict_low >= ind.conflict_high
        {
            return fail(format!(
                "RSI conflict bands {}/{} must satisfy 0 <= low < high <= 100",
                ind.conflict_low, ind.conflict_high
            ));
        }
        if ind.stoch_lower >= ind.stoch_upper {
            return fail("stochastic lower band must be below upper band".into());
        }
        if ind.keltner_mult <= 0.0 {
            return fail("Keltner multiplier must be positive".into());
        }

        if self.breakout.range_bars == 0 {
            return fail("breakout range must span at least one bar".into());
        }
        if !(0.0..1.0).contains(&self.breakout.body_ratio) {
            return fail("breakout body ratio must be in [0, 1)".into());
        }
        if self.gaps.max_gaps == 0 {
            return fail("max retained gaps must be positive".into());
        }
        if self.zones.swing_lookback == 0 {
            return fail("swing lookback must be positive".into());
        }

        let needed = [
            ind.rsi_period + 1,
            ind.stoch_k + ind.stoch_d - 1,
            ind.ema_len,
            ind.atr_len + 1,
            self.breakout.range_bars + 1,
            2 * self.zones.swing_lookback + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        if self.candle_capacity < needed {
            return fail(format!(
                "candle capacity {} cannot hold the {} bars the indicators need",
                self.candle_capacity, needed
            ));
        }

        if self.score_threshold <= 0 {
            return fail("score threshold must be positive".into());
        }

        let el = &self.eligibility;
        for (name, v) in [
            ("min payout rate", el.min_payout_rate),
            ("min profit threshold", el.min_profit_threshold),
            ("fallback payout rate", el.fallback_payout_rate),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return fail(format!("{name} {v} must be within [0, 1]"));
            }
        }
        if el.payout_ttl <= ChronoDuration::zero() {
            return fail("payout cache TTL must be positive".into());
        }

        if self.debounce_window < ChronoDuration::zero() {
            return fail("debounce window must not be negative".into());
        }
        if self.max_consecutive_errors == 0 {
            return fail("max consecutive errors must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn tolerance_parses_absolute_and_percent() {
        assert_eq!("0.003".parse::<ZoneTolerance>(), Ok(ZoneTolerance::Absolute(0.003)));
        match "0.5%".parse::<ZoneTolerance>() {
            Ok(ZoneTolerance::Percent(p)) => assert!((p - 0.005).abs() < 1e-12),
            other => panic!("unexpected {other:?}"),
        }
        assert!("-1".parse::<ZoneTolerance>().is_err());
        assert!("abc%".parse::<ZoneTolerance>().is_err());
    }

    #[test]
    fn percent_band_scales_with_level() {
        let tol = ZoneTolerance::Percent(0.01);
        assert!((tol.band(200.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn capacity_must_cover_indicator_history() {
        let cfg = EngineConfig {
            candle_capacity: 10,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn non_finite_indicator_params_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.indicators.keltner_mult = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = EngineConfig::default();
        cfg.indicators.conflict_high = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_conflict_bands_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.indicators.conflict_low = 65.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_rsi_bands_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.indicators.rsi_oversold = 80.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn payout_rates_must_be_fractions() {
        let mut cfg = EngineConfig::default();
        cfg.eligibility.min_payout_rate = 82.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shared_timeframes_are_fetched_once() {
        let mut cfg = EngineConfig::default();
        cfg.timeframes.mtf = cfg.timeframes.htf.clone();
        let tfs = cfg.timeframes.distinct();
        assert_eq!(tfs.len(), 2);
        assert_eq!(tfs[0].label(), "1m");
    }
}
