//! Candle sources behind the [`MarketFeed`] seam.
//! -----------------------------------------------------------------
//! ‣ `HttpFeed`      – polls a REST candle endpoint (live mode).
//! ‣ `SyntheticFeed` – seeded random walk, one stream per
//!   (instrument, timeframe), for demo runs without a broker.
//! -----------------------------------------------------------------

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::{
    services::{
        clock::Clock,
        strategies::{Candle, Timeframe},
    },
    utils::errors::FeedError,
};

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Candles oldest-first, none older than `since` when given. The bar
    /// stamped exactly `since` may come back with revised values.
    async fn fetch_candles(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, FeedError>;
}

// ---------------------------  HTTP  ---------------------------

/// Wire shape: `{"t": 1700000000, "o": .., "h": .., "l": .., "c": .., "v": ..}`.
#[derive(Debug, Deserialize)]
struct WireCandle {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: Option<f64>,
}

impl TryFrom<WireCandle> for Candle {
    type Error = FeedError;

    fn try_from(w: WireCandle) -> Result<Self, Self::Error> {
        let ts = DateTime::<Utc>::from_timestamp(w.t, 0)
            .ok_or_else(|| FeedError::Malformed(format!("timestamp {}", w.t)))?;
        let finite = [w.o, w.h, w.l, w.c].iter().all(|x| x.is_finite());
        if !finite || w.h < w.l || w.o > w.h || w.o < w.l || w.c > w.h || w.c < w.l {
            return Err(FeedError::Malformed(format!(
                "inconsistent OHLC at {ts}: o={} h={} l={} c={}",
                w.o, w.h, w.l, w.c
            )));
        }
        Ok(Candle {
            ts,
            open: w.o,
            high: w.h,
            low: w.l,
            close: w.c,
            volume: w.v.unwrap_or(0.0),
        })
    }
}

pub struct HttpFeed {
    http: Client,
    base_url: String,
}

impl HttpFeed {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MarketFeed for HttpFeed {
    async fn fetch_candles(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, FeedError> {
        let mut query = vec![
            ("instrument", instrument.to_string()),
            ("timeframe", timeframe.label().to_string()),
        ];
        if let Some(s) = since {
            query.push(("since", s.timestamp().to_string()));
        }

        let resp = self
            .http
            .get(format!("{}/candles", self.base_url))
            .query(&query)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(FeedError::Status(resp.status().as_u16()));
        }

        let wire = resp.json::<Vec<WireCandle>>().await?;
        let candles = wire
            .into_iter()
            .map(Candle::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(since_inclusive(candles, since))
    }
}

/// Sorts and drops bars older than `since`. The bar at `since` itself is
/// kept so the buffer can apply it as a correction.
fn since_inclusive(mut candles: Vec<Candle>, since: Option<DateTime<Utc>>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.ts);
    if let Some(s) = since {
        candles.retain(|c| c.ts >= s);
    }
    candles
}

// ---------------------------  Synthetic  ---------------------------

struct Walk {
    rng: StdRng,
    /// bucket start (unix secs) of the last bar handed out
    last_bucket: i64,
    last_close: f64,
}

/// Deterministic demo data: the same instrument always walks the same path.
pub struct SyntheticFeed {
    clock: Arc<dyn Clock>,
    history: usize,
    walks: Mutex<HashMap<(String, u64), Walk>>,
}

/// FNV-1a; stable across runs and toolchains.
fn seed_for(instrument: &str, timeframe: &Timeframe) -> u64 {
    instrument
        .bytes()
        .chain(timeframe.label().bytes())
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

impl SyntheticFeed {
    /// `history` bars are backfilled the first time a stream is read.
    pub fn new(clock: Arc<dyn Clock>, history: usize) -> Self {
        Self {
            clock,
            history: history.max(1),
            walks: Mutex::new(HashMap::new()),
        }
    }

    fn next_bar(walk: &mut Walk, bucket: i64, tf_secs: u64) -> Candle {
        // volatility grows with the bar length, roughly 3 pips per minute
        let vol = 0.0003 * ((tf_secs as f64) / 60.0).sqrt();
        let open = walk.last_close;
        let close = (open + walk.rng.gen_range(-1.0..1.0) * vol).max(0.0001);
        let wick_up = walk.rng.gen_range(0.0..0.5) * vol;
        let wick_down = walk.rng.gen_range(0.0..0.5) * vol;
        walk.last_close = close;
        walk.last_bucket = bucket;
        Candle {
            ts: DateTime::<Utc>::from_timestamp(bucket, 0).unwrap_or_default(),
            open,
            high: open.max(close) + wick_up,
            low: (open.min(close) - wick_down).max(0.0),
            close,
            volume: walk.rng.gen_range(50.0..500.0_f64).round(),
        }
    }
}

#[async_trait]
impl MarketFeed for SyntheticFeed {
    async fn fetch_candles(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, FeedError> {
        let step = timeframe.secs() as i64;
        let now = self.clock.now().timestamp();
        let current = now - now.rem_euclid(step);

        let mut walks = self.walks.lock().unwrap_or_else(|p| p.into_inner());
        let walk = walks
            .entry((instrument.to_string(), timeframe.secs()))
            .or_insert_with(|| {
                let seed = seed_for(instrument, timeframe);
                Walk {
                    rng: StdRng::seed_from_u64(seed),
                    last_bucket: current - step * self.history as i64,
                    last_close: 1.1 + (seed % 1000) as f64 * 0.0001,
                }
            });

        let mut out = Vec::new();
        let mut bucket = walk.last_bucket + step;
        while bucket <= current {
            out.push(Self::next_bar(walk, bucket, timeframe.secs()));
            bucket += step;
        }
        if let Some(s) = since {
            out.retain(|c| c.ts > s);
        }
        Ok(out)
    }
}
