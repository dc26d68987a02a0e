// src/services/patterns/sr_zones.rs
//! Support/resistance zones clustered from confirmed swing points.
//!
//! A swing at bar `i` needs `L` bars on both sides, so it is confirmed when
//! bar `i + L` arrives. Each confirmed swing either strengthens the nearest
//! zone of the same kind or opens a new one.

use serde::Serialize;

use crate::{config::engine::ZoneParams, services::candle_buffer::Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Support,
    Resistance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SrZone {
    pub kind: ZoneKind,
    pub level: f64,
    pub strength: u32,
    /// sequence number of the latest swing merged in
    pub last_touch_index: u64,
}

#[derive(Debug, Clone)]
pub struct ZoneBook {
    params: ZoneParams,
    zones: Vec<SrZone>,
    processed_through: Option<u64>,
}

impl ZoneBook {
    pub fn new(params: ZoneParams) -> Self {
        Self {
            params,
            zones: Vec::new(),
            processed_through: None,
        }
    }

    /// Confirms swings for every bar of `snap` not seen yet, then prunes.
    pub fn update(&mut self, snap: &Snapshot) {
        let l = self.params.swing_lookback;
        let start = match self.processed_through {
            Some(seq) => snap.index_after(seq),
            None => 0,
        };

        for j in start..snap.len() {
            let Some(i) = j.checked_sub(l) else { continue };
            if i < l {
                continue;
            }
            let window = &snap[i - l..=j];
            let pivot = &snap[i];
            let seq = snap.seq_of(i);

            let others = window
                .iter()
                .enumerate()
                .filter(|(k, _)| *k != l)
                .map(|(_, c)| c);
            if others.clone().all(|c| pivot.high > c.high) {
                self.record_swing(ZoneKind::Resistance, pivot.high, seq);
            }
            if others.clone().all(|c| pivot.low < c.low) {
                self.record_swing(ZoneKind::Support, pivot.low, seq);
            }
        }

        if let Some(last) = snap.last_seq() {
            self.processed_through = Some(last);
            self.prune(last);
        }
    }

    /// Merges `level` into the nearest same-kind zone strictly within
    /// tolerance, or opens a new zone.
    pub fn record_swing(&mut self, kind: ZoneKind, level: f64, index: u64) {
        let tol = self.params.tolerance;
        let nearest = self
            .zones
            .iter_mut()
            .filter(|z| z.kind == kind)
            .map(|z| ((z.level - level).abs(), z))
            .filter(|(dist, z)| *dist < tol.band(z.level))
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match nearest {
            Some((_, zone)) => {
                let s = zone.strength as f64;
                zone.level = (zone.level * s + level) / (s + 1.0);
                zone.strength += 1;
                zone.last_touch_index = zone.last_touch_index.max(index);
            }
            None => self.zones.push(SrZone {
                kind,
                level,
                strength: 1,
                last_touch_index: index,
            }),
        }
    }

    /// Drops stale zones, then weak zones past their grace period.
    pub fn prune(&mut self, current_index: u64) {
        let p = &self.params;
        let age = |z: &SrZone| current_index.saturating_sub(z.last_touch_index);

        self.zones.retain(|z| age(z) <= p.staleness_bars);
        self.zones
            .retain(|z| z.strength >= p.min_strength || age(z) <= p.weak_grace_bars);
    }

    pub fn zones(&self) -> &[SrZone] {
        &self.zones
    }

    /// Closest zone of at least `strong_zone_strength` whose band covers `price`.
    pub fn strong_zone_near(&self, price: f64) -> Option<&SrZone> {
        let p = &self.params;
        self.zones
            .iter()
            .filter(|z| z.strength >= p.strong_zone_strength)
            .filter(|z| (z.level - price).abs() <= p.tolerance.band(z.level))
            .min_by(|a, b| (a.level - price).abs().total_cmp(&(b.level - price).abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::engine::ZoneTolerance,
        services::{candle_buffer::CandleBuffer, strategies::Candle},
    };
    use chrono::{DateTime, Utc};

    fn bar(i: i64, high: f64, low: f64) -> Candle {
        Candle {
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000 + i * 300, 0).unwrap(),
            open: low,
            high,
            low,
            close: high,
            volume: 0.0,
        }
    }

    fn params() -> ZoneParams {
        ZoneParams {
            swing_lookback: 2,
            tolerance: ZoneTolerance::Absolute(0.01),
            staleness_bars: 100,
            min_strength: 2,
            weak_grace_bars: 20,
            strong_zone_strength: 3,
        }
    }

    #[test]
    fn same_level_twice_merges_into_one_zone() {
        let mut book = ZoneBook::new(params());
        book.record_swing(ZoneKind::Resistance, 1.2000, 10);
        book.record_swing(ZoneKind::Resistance, 1.2000, 15);
        assert_eq!(book.zones().len(), 1);
        let z = &book.zones()[0];
        assert_eq!(z.strength, 2);
        assert_eq!(z.level, 1.2000);
        assert_eq!(z.last_touch_index, 15);
    }

    #[test]
    fn merge_is_weighted_and_kind_specific() {
        let mut book = ZoneBook::new(params());
        book.record_swing(ZoneKind::Support, 1.000, 1);
        book.record_swing(ZoneKind::Support, 1.006, 2);
        book.record_swing(ZoneKind::Resistance, 1.003, 3);
        assert_eq!(book.zones().len(), 2);
        let support = &book.zones()[0];
        assert!((support.level - 1.003).abs() < 1e-12);
        assert_eq!(support.strength, 2);
    }

    #[test]
    fn distant_levels_open_separate_zones() {
        let mut book = ZoneBook::new(params());
        book.record_swing(ZoneKind::Support, 1.0, 1);
        book.record_swing(ZoneKind::Support, 1.5, 2);
        assert_eq!(book.zones().len(), 2);
    }

    #[test]
    fn swing_high_confirmed_after_lookback_bars() {
        let mut buf = CandleBuffer::new(50);
        let mut book = ZoneBook::new(params());
        let highs = [1.0, 1.1, 1.5, 1.2, 1.1];
        for (i, h) in highs.iter().enumerate() {
            buf.append(bar(i as i64, *h, h - 0.5)).unwrap();
            book.update(&buf.snapshot());
            if i < 4 {
                assert!(book.zones().iter().all(|z| z.kind != ZoneKind::Resistance));
            }
        }
        let res: Vec<&SrZone> = book
            .zones()
            .iter()
            .filter(|z| z.kind == ZoneKind::Resistance)
            .collect();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].level, 1.5);
        assert_eq!(res[0].last_touch_index, 2);
    }

    #[test]
    fn equal_neighbour_high_is_not_a_swing() {
        let mut buf = CandleBuffer::new(50);
        let mut book = ZoneBook::new(params());
        for (i, h) in [1.0, 1.5, 1.5, 1.2, 1.1].iter().enumerate() {
            buf.append(bar(i as i64, *h, 0.0)).unwrap();
        }
        book.update(&buf.snapshot());
        assert!(book.zones().iter().all(|z| z.kind != ZoneKind::Resistance));
    }

    #[test]
    fn pruning_drops_stale_then_weak() {
        let mut book = ZoneBook::new(params());
        book.record_swing(ZoneKind::Support, 1.0, 0); // weak, old
        book.record_swing(ZoneKind::Support, 2.0, 0);
        book.record_swing(ZoneKind::Support, 2.0, 5); // strong enough, touched at 5
        book.record_swing(ZoneKind::Resistance, 3.0, 40); // weak, recent

        book.prune(50);
        let levels: Vec<f64> = book.zones().iter().map(|z| z.level).collect();
        assert_eq!(levels, vec![2.0, 3.0]);

        book.prune(106);
        let levels: Vec<f64> = book.zones().iter().map(|z| z.level).collect();
        assert!(levels.is_empty());
    }

    #[test]
    fn strong_zone_lookup_respects_strength_and_band() {
        let mut book = ZoneBook::new(params());
        for i in 0..3 {
            book.record_swing(ZoneKind::Support, 1.0, i);
        }
        book.record_swing(ZoneKind::Resistance, 1.004, 3);
        let z = book.strong_zone_near(1.005).unwrap();
        assert_eq!(z.kind, ZoneKind::Support);
        assert!(book.strong_zone_near(1.02).is_none());
    }
}
