//! Bounded, strictly time-ordered candle store for one (instrument, timeframe).
//!
//! Every stored bar gets a sequence number that keeps counting through
//! evictions, so detectors can remember "bar 1234" after the buffer has
//! rolled over. Downstream code only ever sees a [`Snapshot`].

use std::{collections::VecDeque, ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{services::strategies::Candle, utils::errors::BufferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Inserted { seq: u64 },
    /// same timestamp as the newest bar, replaced in place
    Corrected { seq: u64 },
}

#[derive(Debug, Clone)]
pub struct CandleBuffer {
    capacity: usize,
    candles: VecDeque<Candle>,
    next_seq: u64,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity),
            next_seq: 0,
        }
    }

    pub fn append(&mut self, candle: Candle) -> Result<Appended, BufferError> {
        if let Some(last) = self.candles.back_mut() {
            if candle.ts < last.ts {
                return Err(BufferError::OutOfOrderCandle {
                    candle: candle.ts,
                    latest: last.ts,
                });
            }
            if candle.ts == last.ts {
                *last = candle;
                return Ok(Appended::Corrected {
                    seq: self.next_seq - 1,
                });
            }
        }

        self.candles.push_back(candle);
        if self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(Appended::Inserted { seq })
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn latest_ts(&self) -> Option<DateTime<Utc>> {
        self.latest().map(|c| c.ts)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Point-in-time copy of the stored bars, oldest first.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            candles: self.candles.iter().copied().collect(),
            first_seq: self.next_seq - self.candles.len() as u64,
        }
    }
}

/// Immutable, cheap-to-clone view of a buffer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    candles: Arc<[Candle]>,
    first_seq: u64,
}

impl Snapshot {
    /// Builds a snapshot whose first bar carries sequence `first_seq`.
    pub fn from_candles(candles: Vec<Candle>, first_seq: u64) -> Self {
        Self {
            candles: candles.into(),
            first_seq,
        }
    }

    pub fn seq_of(&self, idx: usize) -> u64 {
        self.first_seq + idx as u64
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.candles.len().checked_sub(1).map(|i| self.seq_of(i))
    }

    /// Index of the first bar newer than `seq` (0 if `seq` was already evicted).
    pub fn index_after(&self, seq: u64) -> usize {
        let next = seq + 1;
        if next <= self.first_seq {
            0
        } else {
            ((next - self.first_seq) as usize).min(self.candles.len())
        }
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

impl Deref for Snapshot {
    type Target = [Candle];

    fn deref(&self) -> &Self::Target {
        &self.candles
    }
}
