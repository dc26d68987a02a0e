// src/services/eligibility.rs
//! Payout-rate and profit-potential gate.
//!
//! Payout rates are fetched through a [`PayoutSource`] and cached per
//! instrument for a fixed TTL. A failed lookup degrades to the source's
//! fallback rate; that value is used once and never cached.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use metrics::increment_counter;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::{
    config::engine::EligibilityParams,
    services::{clock::Clock, strategies::confluence::ScoredCandidate},
    utils::errors::PayoutError,
};

// -------------------------------------------------------------------------
// Payout sources
// -------------------------------------------------------------------------

#[async_trait]
pub trait PayoutSource: Send + Sync {
    /// Fractional payout, `0.82` = 82 %.
    async fn payout_rate(&self, instrument: &str, expiry: Option<Duration>) -> Result<f64, PayoutError>;

    /// Rate substituted when a lookup fails.
    fn fallback_rate(&self) -> f64;
}

/// `GET {base}/payout?instrument=..&expiry=..` → `{"payout": 82.0}` or `{"payout": 0.82}`.
pub struct HttpPayoutSource {
    http: Client,
    base_url: String,
    fallback: f64,
}

#[derive(Deserialize)]
struct PayoutResp {
    payout: f64,
}

impl HttpPayoutSource {
    pub fn new(base_url: impl Into<String>, fallback: f64) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fallback,
        }
    }
}

#[async_trait]
impl PayoutSource for HttpPayoutSource {
    async fn payout_rate(&self, instrument: &str, expiry: Option<Duration>) -> Result<f64, PayoutError> {
        let mut query = vec![("instrument", instrument.to_string())];
        if let Some(exp) = expiry {
            query.push(("expiry", exp.as_secs().to_string()));
        }

        let resp = self
            .http
            .get(format!("{}/payout", self.base_url))
            .query(&query)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(PayoutError::Status(resp.status().as_u16()));
        }

        let body = resp.json::<PayoutResp>().await?;
        // brokers quote either 82 or 0.82
        let rate = if body.payout > 1.0 {
            body.payout / 100.0
        } else {
            body.payout
        };
        if !(0.0..=1.0).contains(&rate) {
            return Err(PayoutError::OutOfRange(body.payout));
        }
        Ok(rate)
    }

    fn fallback_rate(&self) -> f64 {
        self.fallback
    }
}

/// Fixed rate for demo runs.
#[derive(Debug, Clone)]
pub struct StaticPayoutSource {
    rate: f64,
}

impl StaticPayoutSource {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl PayoutSource for StaticPayoutSource {
    async fn payout_rate(&self, _instrument: &str, _expiry: Option<Duration>) -> Result<f64, PayoutError> {
        Ok(self.rate)
    }

    fn fallback_rate(&self) -> f64 {
        self.rate
    }
}

// -------------------------------------------------------------------------
// Cache
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoutQuote {
    pub rate: f64,
    /// true when the fallback stood in for a failed lookup
    pub degraded: bool,
}

/// Shared across every instrument task.
pub struct PayoutCache {
    source: Arc<dyn PayoutSource>,
    clock: Arc<dyn Clock>,
    ttl: ChronoDuration,
    expiry: Option<Duration>,
    entries: DashMap<String, (f64, DateTime<Utc>)>,
}

impl PayoutCache {
    pub fn new(
        source: Arc<dyn PayoutSource>,
        clock: Arc<dyn Clock>,
        ttl: ChronoDuration,
        expiry: Option<Duration>,
    ) -> Self {
        Self {
            source,
            clock,
            ttl,
            expiry,
            entries: DashMap::new(),
        }
    }

    fn cached(&self, instrument: &str, now: DateTime<Utc>) -> Option<f64> {
        // copy out; the shard guard must not live across an await
        let (rate, at) = *self.entries.get(instrument)?;
        (now - at < self.ttl).then_some(rate)
    }

    pub async fn quote(&self, instrument: &str) -> PayoutQuote {
        let now = self.clock.now();
        if let Some(rate) = self.cached(instrument, now) {
            increment_counter!("payout_lookups_total", "outcome" => "cached");
            return PayoutQuote { rate, degraded: false };
        }

        let looked_up = self
            .source
            .payout_rate(instrument, self.expiry)
            .await
            .and_then(|r| {
                if (0.0..=1.0).contains(&r) {
                    Ok(r)
                } else {
                    Err(PayoutError::OutOfRange(r))
                }
            });

        match looked_up {
            Ok(rate) => {
                increment_counter!("payout_lookups_total", "outcome" => "fetched");
                self.entries.insert(instrument.to_string(), (rate, now));
                PayoutQuote { rate, degraded: false }
            }
            Err(e) => {
                increment_counter!("payout_lookups_total", "outcome" => "fallback");
                let rate = self.source.fallback_rate();
                log::warn!("payout lookup for {instrument} failed ({e}); using fallback {rate:.2}");
                PayoutQuote { rate, degraded: true }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// -------------------------------------------------------------------------
// Gate
// -------------------------------------------------------------------------

/// Payout × confidence, confidence being `min(|score|, 100) / 100`.
pub fn profit_potential(payout_rate: f64, score: i32) -> f64 {
    payout_rate * f64::from(score.unsigned_abs().min(100)) / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eligible {
    pub payout: PayoutQuote,
    pub profit_potential: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    PayoutBelowMinimum { rate: f64, min: f64 },
    ProfitBelowMinimum { potential: f64, min: f64 },
}

impl Rejection {
    /// Metric label of the failing check.
    pub fn criterion(&self) -> &'static str {
        match self {
            Rejection::PayoutBelowMinimum { .. } => "payout",
            Rejection::ProfitBelowMinimum { .. } => "profit",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::PayoutBelowMinimum { rate, min } => {
                write!(f, "payout {rate:.2} below minimum {min:.2}")
            }
            Rejection::ProfitBelowMinimum { potential, min } => {
                write!(f, "profit potential {potential:.2} below minimum {min:.2}")
            }
        }
    }
}

#[derive(Clone)]
pub struct EligibilityGate {
    cache: Arc<PayoutCache>,
    min_payout_rate: f64,
    min_profit_threshold: f64,
}

impl EligibilityGate {
    pub fn new(cache: Arc<PayoutCache>, params: &EligibilityParams) -> Self {
        Self {
            cache,
            min_payout_rate: params.min_payout_rate,
            min_profit_threshold: params.min_profit_threshold,
        }
    }

    pub fn cache(&self) -> &PayoutCache {
        &self.cache
    }

    /// Payout first, then profit potential. Rejections are logged and
    /// counted here; they are an outcome, not an error.
    pub async fn check(&self, candidate: &ScoredCandidate) -> Result<Eligible, Rejection> {
        let payout = self.cache.quote(&candidate.instrument).await;

        let verdict = if payout.rate < self.min_payout_rate {
            Err(Rejection::PayoutBelowMinimum {
                rate: payout.rate,
                min: self.min_payout_rate,
            })
        } else {
            let potential = profit_potential(payout.rate, candidate.score);
            if potential < self.min_profit_threshold {
                Err(Rejection::ProfitBelowMinimum {
                    potential,
                    min: self.min_profit_threshold,
                })
            } else {
                Ok(Eligible {
                    payout,
                    profit_potential: potential,
                })
            }
        };

        if let Err(r) = &verdict {
            increment_counter!("signal_rejections_total", "criterion" => r.criterion());
            log::info!(
                "{} {} (score {}) rejected: {r}",
                candidate.instrument,
                candidate.direction,
                candidate.score
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{clock::ManualClock, strategies::Direction};
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Scripted source: pops queued results, counts calls.
    struct Scripted {
        results: Mutex<Vec<Result<f64, PayoutError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<f64, PayoutError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PayoutSource for Scripted {
        async fn payout_rate(&self, _i: &str, _e: Option<Duration>) -> Result<f64, PayoutError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop().unwrap_or(Ok(0.9))
        }

        fn fallback_rate(&self) -> f64 {
            0.5
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn candidate(score: i32) -> ScoredCandidate {
        ScoredCandidate {
            instrument: "EURUSD-OTC".into(),
            direction: Direction::Buy,
            score,
            reasons: vec![],
            price: 1.1,
            timestamps: BTreeMap::new(),
            indicators: Default::default(),
        }
    }

    fn cache_with(src: Arc<Scripted>, clock: Arc<ManualClock>) -> Arc<PayoutCache> {
        Arc::new(PayoutCache::new(src, clock, ChronoDuration::hours(1), None))
    }

    #[test]
    fn profit_potential_caps_confidence() {
        assert!((profit_potential(0.8, 50) - 0.4).abs() < 1e-12);
        assert!((profit_potential(0.8, -50) - 0.4).abs() < 1e-12);
        assert!((profit_potential(0.8, 250) - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn cache_serves_within_ttl_and_refetches_after() {
        let src = Arc::new(Scripted::new(vec![Ok(0.8), Ok(0.85)]));
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = cache_with(src.clone(), clock.clone());

        assert_eq!(cache.quote("EURUSD-OTC").await.rate, 0.8);
        clock.advance(ChronoDuration::minutes(59));
        assert_eq!(cache.quote("EURUSD-OTC").await.rate, 0.8);
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);

        clock.advance(ChronoDuration::minutes(1));
        assert_eq!(cache.quote("EURUSD-OTC").await.rate, 0.85);
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_falls_back_without_caching() {
        let src = Arc::new(Scripted::new(vec![Err(PayoutError::Status(503)), Ok(0.9)]));
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = cache_with(src.clone(), clock);

        let q = cache.quote("EURUSD-OTC").await;
        assert_eq!(q, PayoutQuote { rate: 0.5, degraded: true });
        assert!(cache.is_empty());

        let q = cache.quote("EURUSD-OTC").await;
        assert_eq!(q, PayoutQuote { rate: 0.9, degraded: false });
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_rate_is_treated_as_failure() {
        let src = Arc::new(Scripted::new(vec![Ok(1.7)]));
        let cache = cache_with(src, Arc::new(ManualClock::new(t0())));
        assert!(cache.quote("X").await.degraded);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn payout_rejection_then_restore() {
        let src = Arc::new(Scripted::new(vec![Ok(0.60), Ok(0.85)]));
        let clock = Arc::new(ManualClock::new(t0()));
        let gate = EligibilityGate::new(cache_with(src, clock.clone()), &EligibilityParams::default());

        let first = gate.check(&candidate(80)).await;
        assert_eq!(first.unwrap_err().criterion(), "payout");

        clock.advance(ChronoDuration::hours(1));
        let ok = gate.check(&candidate(80)).await.unwrap();
        assert!((ok.profit_potential - 0.68).abs() < 1e-12);
    }

    #[tokio::test]
    async fn weak_score_fails_profit_check() {
        let src = Arc::new(Scripted::new(vec![Ok(0.80)]));
        let gate = EligibilityGate::new(
            cache_with(src, Arc::new(ManualClock::new(t0()))),
            &EligibilityParams::default(),
        );
        // 0.80 * 0.45 = 0.36 < 0.40
        let err = gate.check(&candidate(45)).await.unwrap_err();
        assert!(matches!(err, Rejection::ProfitBelowMinimum { .. }));
    }
}
