// src/services/strategies/confluence.rs
//! Multi-timeframe confluence scoring.
//!
//! Each factor adds or subtracts a fixed weight; positive totals lean BUY,
//! negative lean SELL. Factors are evaluated in a fixed order and every
//! contribution leaves a human-readable reason, so the same inputs always
//! produce the same score and the same reason list.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    config::engine::IndicatorParams,
    services::{
        indicators::{IndicatorSnapshot, Stochastic},
        patterns::{breakout::Breakout, fvg::Gap, sr_zones::{ZoneBook, ZoneKind}},
        strategies::common::{Candle, Direction, Timeframe, TimeframeRole},
    },
};

// --- Weights ---------------------------------------------------------

pub const W_HTF_BREAKOUT: i32 = 25;
pub const W_FVG: i32 = 30;
pub const W_RSI_HTF: i32 = 20;
pub const W_RSI_MTF: i32 = 20;
pub const W_RSI_LTF: i32 = 5;
pub const W_STOCH_MTF: i32 = 10;
pub const W_KELTNER_MTF: i32 = 10;
pub const W_STRONG_ZONE: i32 = 8;
pub const CONFLICT_PENALTY: i32 = 40;

// --- Inputs / outputs ------------------------------------------------

/// Latest state of one timeframe as the scorer sees it.
#[derive(Debug, Clone, Copy)]
pub struct RoleView<'a> {
    pub timeframe: &'a Timeframe,
    pub latest: Option<&'a Candle>,
    pub indicators: IndicatorSnapshot,
}

#[derive(Debug, Clone)]
pub struct ScoreInputs<'a> {
    pub htf: RoleView<'a>,
    pub mtf: RoleView<'a>,
    pub ltf: RoleView<'a>,
    pub htf_breakout: Option<Breakout>,
    /// open gaps of the MTF series, any order
    pub open_gaps: Vec<(TimeframeRole, &'a Gap)>,
    /// zones clustered on the MTF series
    pub zones: Option<&'a ZoneBook>,
}

impl<'a> ScoreInputs<'a> {
    fn role(&self, role: TimeframeRole) -> &RoleView<'a> {
        match role {
            TimeframeRole::Htf => &self.htf,
            TimeframeRole::Mtf => &self.mtf,
            TimeframeRole::Ltf => &self.ltf,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreCard {
    pub score: i32,
    pub reasons: Vec<String>,
}

impl ScoreCard {
    fn add(&mut self, weight: i32, reason: String) {
        self.score += weight;
        self.reasons.push(format!("{reason} {weight:+}"));
    }
}

/// Readings echoed to the operator alongside the reasons.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyIndicators {
    pub mtf_timeframe: String,
    pub mtf_rsi: Option<f64>,
    pub mtf_stochastic: Option<Stochastic>,
    pub htf_timeframe: String,
    /// HTF close against its Keltner middle line; `None` when flat or not warmed up
    pub htf_trend: Option<Direction>,
}

impl KeyIndicators {
    fn from_inputs(inputs: &ScoreInputs<'_>) -> Self {
        let htf = &inputs.htf.indicators;
        let htf_trend = match (htf.close, htf.keltner) {
            (Some(close), Some(kc)) if close > kc.middle => Some(Direction::Buy),
            (Some(close), Some(kc)) if close < kc.middle => Some(Direction::Sell),
            _ => None,
        };
        Self {
            mtf_timeframe: inputs.mtf.timeframe.to_string(),
            mtf_rsi: inputs.mtf.indicators.rsi,
            mtf_stochastic: inputs.mtf.indicators.stochastic,
            htf_timeframe: inputs.htf.timeframe.to_string(),
            htf_trend,
        }
    }
}

/// Transient per-cycle result; becomes a signal only after gating.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub instrument: String,
    pub direction: Direction,
    pub score: i32,
    pub reasons: Vec<String>,
    /// latest LTF close
    pub price: f64,
    pub timestamps: BTreeMap<TimeframeRole, DateTime<Utc>>,
    pub indicators: KeyIndicators,
}

// --- Scorer ----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConfluenceScorer {
    params: IndicatorParams,
    threshold: i32,
}

impl ConfluenceScorer {
    pub fn new(params: IndicatorParams, threshold: i32) -> Self {
        Self { params, threshold }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// +1 oversold, -1 overbought, 0 otherwise.
    fn rsi_lean(&self, rsi: Option<f64>) -> i32 {
        match rsi {
            Some(v) if v < self.params.rsi_oversold => 1,
            Some(v) if v > self.params.rsi_overbought => -1,
            _ => 0,
        }
    }

    /// Runs every factor. `None` when a timeframe has no candles yet.
    pub fn score(&self, inputs: &ScoreInputs<'_>) -> Option<ScoreCard> {
        let price = inputs.ltf.latest?.close;
        if inputs.htf.latest.is_none() || inputs.mtf.latest.is_none() {
            return None;
        }

        let mut card = ScoreCard::default();
        let htf_tf = inputs.htf.timeframe;
        let mtf_tf = inputs.mtf.timeframe;

        // 1. HTF breakout
        if let Some(b) = inputs.htf_breakout {
            let word = match b.direction {
                Direction::Buy => "up",
                Direction::Sell => "down",
            };
            card.add(
                b.direction.sign() * W_HTF_BREAKOUT,
                format!("HTF breakout {word} ({htf_tf})"),
            );
        }

        // 2. newest open gap the price sits in
        let gap = inputs
            .open_gaps
            .iter()
            .filter(|(_, g)| g.is_open() && g.contains(price))
            .max_by(|(_, a), (_, b)| {
                a.created_at
                    .cmp(&b.created_at)
                    .then(a.created_at_index.cmp(&b.created_at_index))
            });
        if let Some((role, g)) = gap {
            let dir = g.side.direction();
            let kind = match dir {
                Direction::Buy => "bullish",
                Direction::Sell => "bearish",
            };
            card.add(
                dir.sign() * W_FVG,
                format!(
                    "Inside {kind} FVG {:.5}-{:.5} ({})",
                    g.lower,
                    g.upper,
                    inputs.role(*role).timeframe
                ),
            );
        }

        // 3. RSI extremes, heaviest timeframe first
        let p = &self.params;
        for (role, weight) in [
            (TimeframeRole::Htf, W_RSI_HTF),
            (TimeframeRole::Mtf, W_RSI_MTF),
            (TimeframeRole::Ltf, W_RSI_LTF),
        ] {
            let view = inputs.role(role);
            let Some(rsi) = view.indicators.rsi else { continue };
            match self.rsi_lean(Some(rsi)) {
                1 => card.add(
                    weight,
                    format!("{} RSI {rsi:.1} <{} ({})", role.label(), p.rsi_oversold, view.timeframe),
                ),
                -1 => card.add(
                    -weight,
                    format!("{} RSI {rsi:.1} >{} ({})", role.label(), p.rsi_overbought, view.timeframe),
                ),
                _ => {}
            }
        }

        // 4. MTF stochastic
        if let Some(st) = inputs.mtf.indicators.stochastic {
            if st.k < p.stoch_lower {
                card.add(W_STOCH_MTF, format!("MTF StochK {:.1} <{} ({mtf_tf})", st.k, p.stoch_lower));
            } else if st.k > p.stoch_upper {
                card.add(-W_STOCH_MTF, format!("MTF StochK {:.1} >{} ({mtf_tf})", st.k, p.stoch_upper));
            }
        }

        // 5. MTF Keltner breach
        if let (Some(kc), Some(close)) = (inputs.mtf.indicators.keltner, inputs.mtf.indicators.close) {
            if close < kc.lower {
                card.add(W_KELTNER_MTF, format!("MTF close below Keltner lower ({mtf_tf})"));
            } else if close > kc.upper {
                card.add(-W_KELTNER_MTF, format!("MTF close above Keltner upper ({mtf_tf})"));
            }
        }

        // 6. strong S/R zone at the current price
        if let Some(zone) = inputs.zones.and_then(|z| z.strong_zone_near(price)) {
            match zone.kind {
                ZoneKind::Support => card.add(
                    W_STRONG_ZONE,
                    format!("Strong support {:.5} (strength {})", zone.level, zone.strength),
                ),
                ZoneKind::Resistance => card.add(
                    -W_STRONG_ZONE,
                    format!("Strong resistance {:.5} (strength {})", zone.level, zone.strength),
                ),
            }
        }

        // 7. HTF and MTF momentum disagree
        if let (Some(h), Some(m)) = (inputs.htf.indicators.rsi, inputs.mtf.indicators.rsi) {
            let opposed = (m < p.conflict_low && h > p.conflict_high)
                || (m > p.conflict_high && h < p.conflict_low);
            if opposed {
                card.score = if card.score > 0 {
                    (card.score - CONFLICT_PENALTY).max(0)
                } else {
                    (card.score + CONFLICT_PENALTY).min(0)
                };
                card.reasons.push(format!(
                    "HTF momentum opposes MTF (HTF RSI {h:.1}, MTF RSI {m:.1}) -{CONFLICT_PENALTY}"
                ));
            }
        }

        Some(card)
    }

    /// Scores and applies the threshold in one step.
    pub fn evaluate(&self, instrument: &str, inputs: &ScoreInputs<'_>) -> Option<ScoredCandidate> {
        let card = self.score(inputs)?;
        self.candidate(instrument, inputs, card)
    }

    /// Applies the threshold: BUY at `>= t`, SELL at `<= -t`.
    pub fn candidate(
        &self,
        instrument: &str,
        inputs: &ScoreInputs<'_>,
        card: ScoreCard,
    ) -> Option<ScoredCandidate> {
        let direction = if card.score >= self.threshold {
            Direction::Buy
        } else if card.score <= -self.threshold {
            Direction::Sell
        } else {
            return None;
        };

        let mut timestamps = BTreeMap::new();
        for role in [TimeframeRole::Htf, TimeframeRole::Mtf, TimeframeRole::Ltf] {
            if let Some(c) = inputs.role(role).latest {
                timestamps.insert(role, c.ts);
            }
        }

        Some(ScoredCandidate {
            instrument: instrument.to_string(),
            direction,
            score: card.score,
            reasons: card.reasons,
            price: inputs.ltf.latest?.close,
            timestamps,
            indicators: KeyIndicators::from_inputs(inputs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::engine::ZoneParams,
        services::{
            indicators::{Keltner, Stochastic},
            patterns::fvg::GapSide,
        },
    };

    fn tf(s: &str) -> Timeframe {
        s.parse().unwrap()
    }

    fn candle(close: f64) -> Candle {
        Candle {
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    fn view<'a>(timeframe: &'a Timeframe, latest: &'a Candle, rsi: Option<f64>) -> RoleView<'a> {
        RoleView {
            timeframe,
            latest: Some(latest),
            indicators: IndicatorSnapshot {
                close: Some(latest.close),
                rsi,
                ..Default::default()
            },
        }
    }

    fn scorer(threshold: i32) -> ConfluenceScorer {
        ConfluenceScorer::new(IndicatorParams::default(), threshold)
    }

    fn bull_gap(lower: f64, upper: f64, idx: u64) -> Gap {
        Gap {
            side: GapSide::Bull,
            upper,
            lower,
            created_at_index: idx,
            created_at: DateTime::<Utc>::from_timestamp(1_600_000_000 + idx as i64, 0).unwrap(),
            filled_at: None,
        }
    }

    #[test]
    fn score_at_threshold_is_buy_one_below_is_nothing() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.0);
        // HTF RSI +20, MTF RSI +20, LTF RSI +5 = 45
        let inputs = ScoreInputs {
            htf: view(&h, &c, Some(25.0)),
            mtf: view(&m, &c, Some(25.0)),
            ltf: view(&l, &c, Some(25.0)),
            htf_breakout: None,
            open_gaps: vec![],
            zones: None,
        };

        let cand = scorer(45).evaluate("EURUSD-OTC", &inputs).unwrap();
        assert_eq!(cand.direction, Direction::Buy);
        assert_eq!(cand.score, 45);
        assert_eq!(cand.reasons.len(), 3);
        assert!(cand.reasons[0].starts_with("HTF RSI 25.0 <30"));
        assert!(cand.reasons[0].ends_with("+20"));
        assert_eq!(cand.indicators.mtf_rsi, Some(25.0));
        assert_eq!(cand.indicators.mtf_timeframe, "5m");
        assert_eq!(cand.indicators.htf_trend, None);

        assert!(scorer(46).evaluate("EURUSD-OTC", &inputs).is_none());
    }

    #[test]
    fn negative_score_yields_sell() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.0);
        let inputs = ScoreInputs {
            htf: view(&h, &c, Some(75.0)),
            mtf: view(&m, &c, Some(75.0)),
            ltf: view(&l, &c, None),
            htf_breakout: Some(Breakout {
                direction: Direction::Sell,
                range_high: 1.2,
                range_low: 1.1,
                body_ratio: 0.8,
            }),
            open_gaps: vec![],
            zones: None,
        };
        let cand = scorer(60).evaluate("X", &inputs).unwrap();
        assert_eq!(cand.direction, Direction::Sell);
        assert_eq!(cand.score, -65);
        assert_eq!(cand.reasons[0], "HTF breakout down (15m) -25");
    }

    #[test]
    fn conflict_pulls_toward_zero() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.05);
        let gap = bull_gap(1.0, 1.1, 3);
        let inputs = ScoreInputs {
            htf: view(&h, &c, Some(80.0)), // -20
            mtf: view(&m, &c, Some(20.0)), // +20
            ltf: view(&l, &c, Some(20.0)), // +5
            htf_breakout: Some(Breakout {
                direction: Direction::Buy,
                range_high: 1.0,
                range_low: 0.9,
                body_ratio: 0.9,
            }), // +25
            open_gaps: vec![(TimeframeRole::Mtf, &gap)], // +30
            zones: None,
        };
        let card = scorer(60).score(&inputs).unwrap();
        assert_eq!(card.score, 60 - CONFLICT_PENALTY);
        assert!(card.reasons.last().unwrap().starts_with("HTF momentum opposes MTF"));

        // never crosses zero
        let weak = ScoreInputs {
            htf_breakout: None,
            open_gaps: vec![],
            ..inputs.clone()
        };
        assert_eq!(scorer(60).score(&weak).unwrap().score, 0);
    }

    #[test]
    fn conflict_uses_the_wider_bands() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.0);
        let up = Some(Breakout {
            direction: Direction::Buy,
            range_high: 0.99,
            range_low: 0.9,
            body_ratio: 0.9,
        });
        // HTF 65 is neutral for its own factor but still past the conflict band
        let inputs = ScoreInputs {
            htf: view(&h, &c, Some(65.0)),
            mtf: view(&m, &c, Some(25.0)), // +20
            ltf: view(&l, &c, Some(25.0)), // +5
            htf_breakout: up, // +25
            open_gaps: vec![],
            zones: None,
        };
        let card = scorer(0).score(&inputs).unwrap();
        assert_eq!(card.score, 50 - CONFLICT_PENALTY);
        assert!(card.reasons.last().unwrap().starts_with("HTF momentum opposes MTF (HTF RSI 65.0"));

        // inside the bands nothing is deducted
        let calm = ScoreInputs {
            htf: view(&h, &c, Some(55.0)),
            ..inputs.clone()
        };
        assert_eq!(scorer(0).score(&calm).unwrap().score, 50);
    }

    #[test]
    fn only_newest_containing_gap_counts() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.05);
        let older = bull_gap(1.0, 1.1, 1);
        let newer = Gap {
            side: GapSide::Bear,
            ..bull_gap(1.04, 1.06, 2)
        };
        let mut filled = bull_gap(1.0, 1.1, 9);
        filled.filled_at = Some(filled.created_at);

        let inputs = ScoreInputs {
            htf: view(&h, &c, None),
            mtf: view(&m, &c, None),
            ltf: view(&l, &c, None),
            htf_breakout: None,
            open_gaps: vec![
                (TimeframeRole::Htf, &older),
                (TimeframeRole::Mtf, &newer),
                (TimeframeRole::Mtf, &filled),
            ],
            zones: None,
        };
        let card = scorer(60).score(&inputs).unwrap();
        assert_eq!(card.score, -W_FVG);
        assert_eq!(card.reasons.len(), 1);
        assert!(card.reasons[0].contains("bearish FVG"));
    }

    #[test]
    fn mtf_stochastic_keltner_and_zone_factors() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.0);
        let mut mtf = view(&m, &c, None);
        mtf.indicators.stochastic = Some(Stochastic { k: 10.0, d: 15.0 });
        mtf.indicators.keltner = Some(Keltner {
            upper: 1.2,
            middle: 1.1,
            lower: 1.05,
        });

        let mut zones = ZoneBook::new(ZoneParams::default());
        for i in 0..3 {
            zones.record_swing(ZoneKind::Support, 1.001, i);
        }

        let inputs = ScoreInputs {
            htf: view(&h, &c, None),
            mtf,
            ltf: view(&l, &c, None),
            htf_breakout: None,
            open_gaps: vec![],
            zones: Some(&zones),
        };
        let card = scorer(60).score(&inputs).unwrap();
        assert_eq!(card.score, W_STOCH_MTF + W_KELTNER_MTF + W_STRONG_ZONE);
        assert_eq!(card.reasons.len(), 3);
        assert!(card.reasons[2].starts_with("Strong support"));
    }

    #[test]
    fn missing_timeframe_gives_no_candidate() {
        let (h, m, l) = (tf("15m"), tf("5m"), tf("1m"));
        let c = candle(1.0);
        let inputs = ScoreInputs {
            htf: RoleView {
                timeframe: &h,
                latest: None,
                indicators: IndicatorSnapshot::default(),
            },
            mtf: view(&m, &c, Some(10.0)),
            ltf: view(&l, &c, Some(10.0)),
            htf_breakout: None,
            open_gaps: vec![],
            zones: None,
        };
        assert!(scorer(1).score(&inputs).is_none());
        assert!(scorer(1).evaluate("X", &inputs).is_none());
    }
}
