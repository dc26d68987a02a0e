// src/services/debounce.rs
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::services::strategies::Direction;

/// Minimum spacing between signals of the same (instrument, direction).
/// Owned by one instrument engine; no locking.
#[derive(Debug, Clone)]
pub struct DebounceGate {
    window: Duration,
    records: HashMap<(String, Direction), DateTime<Utc>>,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: HashMap::new(),
        }
    }

    /// Passes when nothing was emitted yet or `now - last >= window`, and
    /// records `now` on pass. A pass never moves the record backwards.
    pub fn try_pass(&mut self, instrument: &str, direction: Direction, now: DateTime<Utc>) -> bool {
        let key = (instrument.to_string(), direction);
        match self.records.get(&key) {
            Some(&last) if now - last < self.window => {
                log::debug!(
                    "{instrument} {direction} debounced ({}s since last)",
                    (now - last).num_seconds()
                );
                false
            }
            Some(&last) => {
                self.records.insert(key, last.max(now));
                true
            }
            None => {
                self.records.insert(key, now);
                true
            }
        }
    }

    pub fn last_emitted(&self, instrument: &str, direction: Direction) -> Option<DateTime<Utc>> {
        self.records.get(&(instrument.to_string(), direction)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn inside_window_is_suppressed() {
        let mut gate = DebounceGate::new(Duration::seconds(1800));
        assert!(gate.try_pass("EURUSD-OTC", Direction::Buy, t(0)));
        assert!(!gate.try_pass("EURUSD-OTC", Direction::Buy, t(1799)));
        assert_eq!(gate.last_emitted("EURUSD-OTC", Direction::Buy), Some(t(0)));
    }

    #[test]
    fn exactly_the_window_passes() {
        let mut gate = DebounceGate::new(Duration::seconds(1800));
        assert!(gate.try_pass("EURUSD-OTC", Direction::Buy, t(0)));
        assert!(gate.try_pass("EURUSD-OTC", Direction::Buy, t(1800)));
        assert_eq!(gate.last_emitted("EURUSD-OTC", Direction::Buy), Some(t(1800)));
    }

    #[test]
    fn directions_and_instruments_are_independent() {
        let mut gate = DebounceGate::new(Duration::seconds(1800));
        assert!(gate.try_pass("EURUSD-OTC", Direction::Buy, t(0)));
        assert!(gate.try_pass("EURUSD-OTC", Direction::Sell, t(10)));
        assert!(gate.try_pass("GBPUSD-OTC", Direction::Buy, t(20)));
        assert!(!gate.try_pass("GBPUSD-OTC", Direction::Buy, t(30)));
    }

    #[test]
    fn zero_window_never_suppresses() {
        let mut gate = DebounceGate::new(Duration::zero());
        assert!(gate.try_pass("X", Direction::Sell, t(5)));
        assert!(gate.try_pass("X", Direction::Sell, t(5)));
    }
}
