// src/services/patterns/fvg.rs
//! Fair-value-gap lifecycle: three-bar price voids, tracked Open → Filled.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::services::{
    candle_buffer::Snapshot,
    strategies::{Candle, Direction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GapSide {
    Bull,
    Bear,
}

impl GapSide {
    pub fn direction(&self) -> Direction {
        match self {
            GapSide::Bull => Direction::Buy,
            GapSide::Bear => Direction::Sell,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gap {
    pub side: GapSide,
    pub upper: f64,
    pub lower: f64,
    /// sequence number of the creating bar
    pub created_at_index: u64,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Gap {
    pub fn is_open(&self) -> bool {
        self.filled_at.is_none()
    }

    pub fn contains(&self, price: f64) -> bool {
        self.lower <= price && price <= self.upper
    }

    /// Whether the bar traded anywhere inside the gap.
    pub fn intersects(&self, candle: &Candle) -> bool {
        candle.low <= self.upper && candle.high >= self.lower
    }
}

/// Three-bar creation rule applied to `c0` (two back) and `c2` (current).
fn gap_between(c0: &Candle, c2: &Candle) -> Option<(GapSide, f64, f64)> {
    if c2.low > c0.high {
        Some((GapSide::Bull, c2.low, c0.high))
    } else if c2.high < c0.low {
        Some((GapSide::Bear, c0.low, c2.high))
    } else {
        None
    }
}

/// Gaps of one (instrument, timeframe). Each bar is processed exactly once,
/// keyed by its buffer sequence number.
#[derive(Debug, Clone)]
pub struct GapTracker {
    gaps: VecDeque<Gap>,
    max_gaps: usize,
    processed_through: Option<u64>,
}

impl GapTracker {
    pub fn new(max_gaps: usize) -> Self {
        Self {
            gaps: VecDeque::new(),
            max_gaps: max_gaps.max(1),
            processed_through: None,
        }
    }

    /// Runs fill-then-create for every bar in `snap` not seen before.
    /// Returns how many gaps changed state (created or filled).
    pub fn update(&mut self, snap: &Snapshot) -> usize {
        let start = match self.processed_through {
            Some(seq) => snap.index_after(seq),
            None => 0,
        };
        let mut changes = 0;

        for i in start..snap.len() {
            let bar = &snap[i];

            for gap in self.gaps.iter_mut().filter(|g| g.is_open()) {
                if gap.intersects(bar) {
                    gap.filled_at = Some(bar.ts);
                    changes += 1;
                    log::debug!(
                        "{:?} gap [{}, {}] filled at {}",
                        gap.side,
                        gap.lower,
                        gap.upper,
                        bar.ts
                    );
                }
            }

            if i >= 2 {
                if let Some((side, upper, lower)) = gap_between(&snap[i - 2], bar) {
                    self.gaps.push_back(Gap {
                        side,
                        upper,
                        lower,
                        created_at_index: snap.seq_of(i),
                        created_at: bar.ts,
                        filled_at: None,
                    });
                    changes += 1;
                }
            }
        }

        while self.gaps.len() > self.max_gaps {
            self.gaps.pop_front();
        }
        if let Some(last) = snap.last_seq() {
            self.processed_through = Some(last);
        }
        changes
    }

    /// Open gaps, most recently created first.
    pub fn open_gaps(&self) -> impl Iterator<Item = &Gap> {
        self.gaps.iter().rev().filter(|g| g.is_open())
    }

    pub fn all(&self) -> impl Iterator<Item = &Gap> {
        self.gaps.iter()
    }

    pub fn len(&self) -> usize {
        self.gaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }
}
