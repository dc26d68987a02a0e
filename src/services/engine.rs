// src/services/engine.rs
//! One instrument's complete analysis state and its strictly sequential
//! cycle: fetch → ingest → detect → score → eligibility → debounce → dispatch.
//!
//! Only the fetch and the payout lookup await; everything between them is
//! synchronous so a cycle never leaves a buffer half-updated.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;

use crate::{
    config::engine::EngineConfig,
    services::{
        candle_buffer::{Appended, CandleBuffer, Snapshot},
        clock::Clock,
        debounce::DebounceGate,
        dispatcher::{Dispatched, SignalDispatcher},
        eligibility::{EligibilityGate, Rejection},
        indicators::IndicatorEngine,
        market_data::MarketFeed,
        patterns::{breakout, fvg::GapTracker, sr_zones::ZoneBook},
        scheduler::Shutdown,
        strategies::{
            confluence::{ConfluenceScorer, RoleView, ScoreInputs, ScoredCandidate},
            Candle, Direction, Timeframe, TimeframeRole,
        },
    },
    utils::errors::EngineError,
};

/// Collaborators shared by every instrument engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub feed: Arc<dyn MarketFeed>,
    pub eligibility: EligibilityGate,
    pub dispatcher: SignalDispatcher,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoCandidate,
    Rejected(Rejection),
    Debounced(Direction),
    Emitted(Dispatched),
    /// shutdown observed after the fetch; nothing was ingested
    Interrupted,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::NoCandidate => "no_candidate",
            CycleOutcome::Rejected(_) => "rejected",
            CycleOutcome::Debounced(_) => "debounced",
            CycleOutcome::Emitted(_) => "emitted",
            CycleOutcome::Interrupted => "interrupted",
        }
    }
}

pub struct InstrumentEngine {
    instrument: String,
    cfg: Arc<EngineConfig>,
    buffers: BTreeMap<Timeframe, CandleBuffer>,
    gaps: GapTracker,
    zones: ZoneBook,
    indicators: IndicatorEngine,
    scorer: ConfluenceScorer,
    debounce: DebounceGate,
    last_score: Option<i32>,
}

impl InstrumentEngine {
    pub fn new(instrument: impl Into<String>, cfg: Arc<EngineConfig>) -> Self {
        let tfs = cfg.timeframes.distinct();
        let buffers = tfs
            .iter()
            .map(|tf| (tf.clone(), CandleBuffer::new(cfg.candle_capacity)))
            .collect();
        Self {
            instrument: instrument.into(),
            buffers,
            gaps: GapTracker::new(cfg.gaps.max_gaps),
            zones: ZoneBook::new(cfg.zones.clone()),
            indicators: IndicatorEngine::new(cfg.indicators.clone()),
            scorer: ConfluenceScorer::new(cfg.indicators.clone(), cfg.score_threshold),
            debounce: DebounceGate::new(cfg.debounce_window),
            last_score: None,
            cfg,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn last_score(&self) -> Option<i32> {
        self.last_score
    }

    pub fn buffered(&self, timeframe: &Timeframe) -> usize {
        self.buffers.get(timeframe).map_or(0, CandleBuffer::len)
    }

    pub fn latest_candle(&self, timeframe: &Timeframe) -> Option<Candle> {
        self.buffers.get(timeframe)?.latest().copied()
    }

    pub fn zones(&self) -> &ZoneBook {
        &self.zones
    }

    pub fn open_gap_count(&self) -> usize {
        self.gaps.open_gaps().count()
    }

    pub fn latest_candle_at(&self) -> Option<DateTime<Utc>> {
        self.buffers.get(&self.cfg.timeframes.ltf)?.latest_ts()
    }

    /// One full pass. Feed failures end the cycle before any buffer changes.
    pub async fn run_cycle(&mut self, deps: &EngineDeps, shutdown: &Shutdown) -> Result<CycleOutcome, EngineError> {
        let fetches = self.buffers.iter().map(|(tf, buf)| {
            let feed = Arc::clone(&deps.feed);
            let since = buf.latest_ts();
            let instrument = self.instrument.as_str();
            async move {
                feed.fetch_candles(instrument, tf, since)
                    .await
                    .map(|candles| (tf.clone(), candles))
                    .map_err(|source| EngineError::FeedUnavailable {
                        timeframe: tf.label().to_string(),
                        source,
                    })
            }
        });
        let batches = try_join_all(fetches).await?;

        if shutdown.is_triggered() {
            log::info!("{}: shutdown requested, skipping compute", self.instrument);
            return Ok(CycleOutcome::Interrupted);
        }

        self.ingest(batches);
        let Some(candidate) = self.evaluate() else {
            return Ok(CycleOutcome::NoCandidate);
        };

        let eligible = match deps.eligibility.check(&candidate).await {
            Ok(e) => e,
            Err(rejection) => return Ok(CycleOutcome::Rejected(rejection)),
        };

        let now = deps.clock.now();
        if !self.debounce.try_pass(&self.instrument, candidate.direction, now) {
            return Ok(CycleOutcome::Debounced(candidate.direction));
        }

        let dispatched = deps.dispatcher.dispatch(candidate, &eligible, now).await;
        Ok(CycleOutcome::Emitted(dispatched))
    }

    /// Appends fetched candles; returns how many new bars were stored.
    pub fn ingest(&mut self, batches: Vec<(Timeframe, Vec<Candle>)>) -> usize {
        let mut inserted = 0;
        for (tf, candles) in batches {
            let Some(buf) = self.buffers.get_mut(&tf) else { continue };
            for candle in candles {
                match buf.append(candle) {
                    Ok(Appended::Inserted { .. }) => inserted += 1,
                    Ok(Appended::Corrected { seq }) => {
                        log::debug!("{} {tf}: bar {seq} corrected", self.instrument);
                    }
                    Err(e) => log::warn!("{} {tf}: {e}; candle dropped", self.instrument),
                }
            }
        }
        inserted
    }

    /// Updates detectors from the current buffers and scores the result.
    pub fn evaluate(&mut self) -> Option<ScoredCandidate> {
        let cfg = Arc::clone(&self.cfg);
        let roles = &cfg.timeframes;

        let snaps: BTreeMap<Timeframe, Snapshot> = self
            .buffers
            .iter()
            .map(|(tf, buf)| (tf.clone(), buf.snapshot()))
            .collect();

        if let Some(snap) = snaps.get(&roles.mtf) {
            self.gaps.update(snap);
            self.zones.update(snap);
        }

        let indicators = &self.indicators;
        let view = |role: TimeframeRole| {
            let tf = roles.get(role);
            let snap = snaps.get(tf);
            RoleView {
                timeframe: tf,
                latest: snap.and_then(|s| s.latest()),
                indicators: snap.map(|s| indicators.compute(s)).unwrap_or_default(),
            }
        };

        let inputs = ScoreInputs {
            htf: view(TimeframeRole::Htf),
            mtf: view(TimeframeRole::Mtf),
            ltf: view(TimeframeRole::Ltf),
            htf_breakout: snaps
                .get(&roles.htf)
                .and_then(|s| breakout::detect(s, &cfg.breakout)),
            open_gaps: self.gaps.open_gaps().map(|g| (TimeframeRole::Mtf, g)).collect(),
            zones: Some(&self.zones),
        };

        let card = self.scorer.score(&inputs);
        self.last_score = card.as_ref().map(|c| c.score);
        let candidate = self.scorer.candidate(&self.instrument, &inputs, card?);
        if let Some(c) = &candidate {
            log::debug!("{} candidate {} score {}", self.instrument, c.direction, c.score);
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, step: i64, close: f64) -> Candle {
        Candle {
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000 + i * step, 0).unwrap(),
            open: close,
            high: close + 0.0005,
            low: close - 0.0005,
            close,
            volume: 0.0,
        }
    }

    fn engine() -> InstrumentEngine {
        InstrumentEngine::new("EURUSD-OTC", Arc::new(EngineConfig::default()))
    }

    #[test]
    fn empty_buffers_give_no_candidate() {
        let mut e = engine();
        assert!(e.evaluate().is_none());
        assert_eq!(e.last_score(), None);
    }

    #[test]
    fn ingest_drops_out_of_order_and_counts_new_bars() {
        let mut e = engine();
        let ltf = EngineConfig::default().timeframes.ltf;
        let n = e.ingest(vec![(
            ltf.clone(),
            vec![bar(1, 60, 1.0), bar(0, 60, 1.0), bar(2, 60, 1.0), bar(2, 60, 1.1)],
        )]);
        assert_eq!(n, 2);
        assert_eq!(e.buffered(&ltf), 2);
    }

    #[test]
    fn falling_market_reads_oversold_once_all_roles_have_data() {
        let mut e = engine();
        let roles = EngineConfig::default().timeframes;
        let falling = |step: i64| -> Vec<Candle> { (0..60).map(|i| bar(i, step, 2.0 - i as f64 * 0.001)).collect() };

        e.ingest(vec![(roles.htf.clone(), falling(900)), (roles.mtf.clone(), falling(300))]);
        assert!(e.evaluate().is_none());

        e.ingest(vec![(roles.ltf.clone(), falling(60))]);
        e.evaluate();
        // steadily falling closes: RSI oversold on every role
        assert!(e.last_score().unwrap() > 0);
    }

    #[test]
    fn only_mtf_gaps_are_tracked() {
        let mut e = engine();
        let roles = EngineConfig::default().timeframes;
        let jump = |step: i64| vec![bar(0, step, 1.0), bar(1, step, 1.0), bar(2, step, 1.01)];

        e.ingest(vec![(roles.htf.clone(), jump(900))]);
        e.evaluate();
        assert_eq!(e.open_gap_count(), 0);

        e.ingest(vec![(roles.mtf.clone(), jump(300))]);
        e.evaluate();
        assert_eq!(e.open_gap_count(), 1);
    }
}
