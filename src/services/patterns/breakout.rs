// src/services/patterns/breakout.rs
//! Range breakout: a strong-bodied close outside the prior `range_bars` range.

use serde::Serialize;

use crate::{
    config::engine::BreakoutParams,
    services::strategies::{Candle, Direction},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Breakout {
    pub direction: Direction,
    pub range_high: f64,
    pub range_low: f64,
    pub body_ratio: f64,
}

/// Checks the last candle against the `range_bars` candles before it.
/// Needs `range_bars + 1` candles; a zero-range last candle never breaks out.
pub fn detect(candles: &[Candle], params: &BreakoutParams) -> Option<Breakout> {
    let n = params.range_bars;
    if n == 0 || candles.len() < n + 1 {
        return None;
    }
    let (prior, last) = candles.split_at(candles.len() - 1);
    let current = last.first()?;
    let window = &prior[prior.len() - n..];

    let range_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let range_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    let span = current.range();
    if span <= 0.0 {
        return None;
    }
    let body_ratio = current.body() / span;
    if body_ratio <= params.body_ratio {
        return None;
    }

    let direction = if current.close > range_high {
        Direction::Buy
    } else if current.close < range_low {
        Direction::Sell
    } else {
        return None;
    };

    Some(Breakout {
        direction,
        range_high,
        range_low,
        body_ratio,
    })
}
