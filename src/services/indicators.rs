// src/services/indicators.rs
//! Momentum and volatility indicators over a candle snapshot.
//!
//! Everything here is a pure function of its input. Not enough history means
//! `None`; callers never see NaN or a zero standing in for "unknown".

use serde::Serialize;

use crate::{config::engine::IndicatorParams, services::strategies::Candle};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keltner {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Wilder RSI of the last close. Needs `period + 1` closes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut changes = closes.windows(2).map(|w| w[1] - w[0]);
    let (mut avg_gain, mut avg_loss) = (0.0, 0.0);
    for ch in changes.by_ref().take(period) {
        if ch > 0.0 {
            avg_gain += ch;
        } else {
            avg_loss -= ch;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let p = period as f64;
    for ch in changes {
        avg_gain = (avg_gain * (p - 1.0) + ch.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-ch).max(0.0)) / p;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Raw %K for the window ending at `end` (exclusive).
fn percent_k(candles: &[Candle], end: usize, k: usize) -> f64 {
    let window = &candles[end - k..end];
    let hh = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let ll = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let close = candles[end - 1].close;
    if hh - ll <= 0.0 {
        50.0
    } else {
        100.0 * (close - ll) / (hh - ll)
    }
}

/// %K over `k` bars and %D as the `d`-bar SMA of %K. Needs `k + d - 1` candles.
pub fn stochastic(candles: &[Candle], k: usize, d: usize) -> Option<Stochastic> {
    if k == 0 || d == 0 || candles.len() < k + d - 1 {
        return None;
    }
    let n = candles.len();
    let ks: Vec<f64> = (n + 1 - d..=n).map(|end| percent_k(candles, end, k)).collect();
    let d_val = ks.iter().sum::<f64>() / d as f64;
    Some(Stochastic {
        k: *ks.last()?,
        d: d_val,
    })
}

/// EMA seeded with the first value, `alpha = 2 / (len + 1)`.
pub fn ema(values: &[f64], len: usize) -> Option<f64> {
    if len == 0 || values.len() < len {
        return None;
    }
    let alpha = 2.0 / (len as f64 + 1.0);
    let mut iter = values.iter();
    let mut acc = *iter.next()?;
    for v in iter {
        acc = alpha * v + (1.0 - alpha) * acc;
    }
    Some(acc)
}

fn true_range(prev_close: f64, c: &Candle) -> f64 {
    (c.high - c.low)
        .max((c.high - prev_close).abs())
        .max((c.low - prev_close).abs())
}

/// Wilder ATR. Needs `period + 1` candles since TR uses the previous close.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let mut trs = candles.windows(2).map(|w| true_range(w[0].close, &w[1]));

    let p = period as f64;
    let mut avg = trs.by_ref().take(period).sum::<f64>() / p;
    for tr in trs {
        avg = (avg * (p - 1.0) + tr) / p;
    }
    Some(avg)
}

/// EMA(close) ± mult × ATR.
pub fn keltner(candles: &[Candle], ema_len: usize, atr_len: usize, mult: f64) -> Option<Keltner> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let middle = ema(&closes, ema_len)?;
    let width = mult * atr(candles, atr_len)?;
    Some(Keltner {
        upper: middle + width,
        middle,
        lower: middle - width,
    })
}

// --- Engine ----------------------------------------------------------

/// Everything the scorer reads for one timeframe at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub close: Option<f64>,
    pub rsi: Option<f64>,
    pub stochastic: Option<Stochastic>,
    pub atr: Option<f64>,
    pub keltner: Option<Keltner>,
}

#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    params: IndicatorParams,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    pub fn compute(&self, candles: &[Candle]) -> IndicatorSnapshot {
        let p = &self.params;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        IndicatorSnapshot {
            close: closes.last().copied(),
            rsi: rsi(&closes, p.rsi_period),
            stochastic: stochastic(candles, p.stoch_k, p.stoch_d),
            atr: atr(candles, p.atr_len),
            keltner: keltner(candles, p.ema_len, p.atr_len, p.keltner_mult),
        }
    }
}
