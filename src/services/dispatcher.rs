// src/services/dispatcher.rs
//! Turns a gated candidate into an immutable [`Signal`] and hands it to the
//! configured sink. Delivery is fire-once: failures are logged and counted,
//! never retried.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::increment_counter;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    services::{
        eligibility::Eligible,
        strategies::{
            confluence::{KeyIndicators, ScoredCandidate},
            Direction,
        },
    },
    utils::errors::DispatchError,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub score: i32,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub payout_rate: f64,
    pub profit_potential: f64,
    /// payout came from the fallback rather than a live lookup
    pub payout_degraded: bool,
    pub reasons: Vec<String>,
    pub indicators: KeyIndicators,
}

// -------------------------------------------------------------------------
// Sink seam
// -------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, signal: &Signal) -> Result<(), DispatchError>;

    /// Free-form operator message (startup / shutdown notices).
    async fn notify_text(&self, _text: &str) -> Result<(), DispatchError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub signal: Signal,
    pub delivered: bool,
}

#[derive(Clone)]
pub struct SignalDispatcher {
    sink: Arc<dyn Notifier>,
}

impl SignalDispatcher {
    pub fn new(sink: Arc<dyn Notifier>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn Notifier> {
        &self.sink
    }

    pub fn build(candidate: ScoredCandidate, eligible: &Eligible, now: DateTime<Utc>) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            instrument: candidate.instrument,
            direction: candidate.direction,
            score: candidate.score,
            price: candidate.price,
            timestamp: now,
            payout_rate: eligible.payout.rate,
            profit_potential: eligible.profit_potential,
            payout_degraded: eligible.payout.degraded,
            reasons: candidate.reasons,
            indicators: candidate.indicators,
        }
    }

    /// The signal counts as emitted whether or not the sink accepted it.
    pub async fn dispatch(
        &self,
        candidate: ScoredCandidate,
        eligible: &Eligible,
        now: DateTime<Utc>,
    ) -> Dispatched {
        let signal = Self::build(candidate, eligible, now);
        increment_counter!("signals_emitted_total", "direction" => signal.direction.as_str());
        log::info!(
            "signal {} {} {} score={} price={:.5} payout={:.2}",
            signal.id,
            signal.instrument,
            signal.direction,
            signal.score,
            signal.price,
            signal.payout_rate
        );

        let delivered = match self.sink.deliver(&signal).await {
            Ok(()) => true,
            Err(e) => {
                increment_counter!("dispatch_failures_total", "sink" => self.sink.name());
                log::error!("{} delivery of signal {} failed: {e}", self.sink.name(), signal.id);
                false
            }
        };
        Dispatched { signal, delivered }
    }
}
