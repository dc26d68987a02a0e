//! One polling task per instrument.
//!
//! Each task owns its [`InstrumentEngine`] outright, so nothing but the
//! payout cache and the status registry is shared between tasks. Cycles are
//! awaited inline: a slow cycle delays the next tick instead of overlapping it.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use metrics::{histogram, increment_counter};
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    config::engine::EngineConfig,
    services::{
        engine::{CycleOutcome, EngineDeps, InstrumentEngine},
        strategies::Timeframe,
    },
    utils::errors::EngineError,
};

// --- Shutdown --------------------------------------------------------

/// Cloneable shutdown flag handed to every worker.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// A dropped trigger counts as shutdown.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// --- Error tracking --------------------------------------------------

/// Consecutive-failure counter with a cooldown once the limit is reached.
#[derive(Debug, Clone)]
pub struct ErrorTracker {
    max_consecutive: u32,
    cooldown: ChronoDuration,
    consecutive: u32,
    cooling_until: Option<DateTime<Utc>>,
}

impl ErrorTracker {
    pub fn new(max_consecutive: u32, cooldown: ChronoDuration) -> Self {
        Self {
            max_consecutive: max_consecutive.max(1),
            cooldown,
            consecutive: 0,
            cooling_until: None,
        }
    }

    /// True while cooling down. The first call after the cooldown has
    /// elapsed clears it and resets the counter.
    pub fn is_cooling(&mut self, now: DateTime<Utc>) -> bool {
        match self.cooling_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.cooling_until = None;
                self.consecutive = 0;
                false
            }
            None => false,
        }
    }

    /// Returns true when this failure started a cooldown.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.max_consecutive && self.cooling_until.is_none() {
            self.cooling_until = Some(now.checked_add_signed(self.cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC));
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn cooling_until(&self) -> Option<DateTime<Utc>> {
        self.cooling_until
    }
}

// --- Status registry -------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstrumentStatus {
    pub instrument: String,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_outcome: String,
    pub last_score: Option<i32>,
    pub latest_candle_at: Option<DateTime<Utc>>,
    pub buffered: BTreeMap<String, usize>,
    pub open_gaps: usize,
    pub zones: usize,
    pub consecutive_errors: u32,
    pub cooling_until: Option<DateTime<Utc>>,
    pub signals_emitted: u64,
    pub last_signal_at: Option<DateTime<Utc>>,
}

/// Written by workers, read by the HTTP status route.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<DashMap<String, InstrumentStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, status: InstrumentStatus) {
        self.inner.insert(status.instrument.clone(), status);
    }

    pub fn get(&self, instrument: &str) -> Option<InstrumentStatus> {
        self.inner.get(instrument).map(|s| s.clone())
    }

    /// All instruments, sorted by name.
    pub fn snapshot(&self) -> Vec<InstrumentStatus> {
        let mut all: Vec<InstrumentStatus> = self.inner.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        all
    }
}

// --- Worker ----------------------------------------------------------

#[derive(Debug)]
pub enum PollResult {
    CoolingDown,
    Completed(CycleOutcome),
    Failed(EngineError),
}

pub struct InstrumentWorker {
    engine: InstrumentEngine,
    deps: EngineDeps,
    errors: ErrorTracker,
    registry: StatusRegistry,
    timeframes: Vec<Timeframe>,
    signals_emitted: u64,
    last_signal_at: Option<DateTime<Utc>>,
}

impl InstrumentWorker {
    pub fn new(engine: InstrumentEngine, cfg: &EngineConfig, deps: EngineDeps, registry: StatusRegistry) -> Self {
        Self {
            engine,
            deps,
            errors: ErrorTracker::new(cfg.max_consecutive_errors, cfg.error_cooldown),
            registry,
            timeframes: cfg.timeframes.distinct(),
            signals_emitted: 0,
            last_signal_at: None,
        }
    }

    pub fn engine(&self) -> &InstrumentEngine {
        &self.engine
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    /// One tick: skip while cooling down, otherwise run a cycle and book
    /// the result against the error counter.
    pub async fn poll_once(&mut self, shutdown: &Shutdown) -> PollResult {
        let now = self.deps.clock.now();
        let instrument = self.engine.instrument().to_string();

        if self.errors.is_cooling(now) {
            log::debug!("{instrument}: cooling down, poll skipped");
            self.publish(now, "cooling_down");
            return PollResult::CoolingDown;
        }

        let started = std::time::Instant::now();
        let result = self.engine.run_cycle(&self.deps, shutdown).await;
        histogram!("cycle_duration_ms", started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(outcome) => {
                self.errors.record_success();
                if let CycleOutcome::Emitted(d) = &outcome {
                    self.signals_emitted += 1;
                    self.last_signal_at = Some(d.signal.timestamp);
                }
                self.publish(now, outcome.label());
                PollResult::Completed(outcome)
            }
            Err(e) => {
                increment_counter!("cycle_errors_total", "instrument" => instrument.clone());
                log::warn!("{instrument}: cycle failed: {e}");
                if self.errors.record_failure(now) {
                    log::error!(
                        "{instrument}: {} consecutive failures, cooling down until {}",
                        self.errors.consecutive(),
                        self.errors.cooling_until().unwrap_or(now)
                    );
                }
                self.publish(now, "error");
                PollResult::Failed(e)
            }
        }
    }

    fn publish(&self, now: DateTime<Utc>, outcome: &str) {
        self.registry.update(InstrumentStatus {
            instrument: self.engine.instrument().to_string(),
            last_poll_at: Some(now),
            last_outcome: outcome.to_string(),
            last_score: self.engine.last_score(),
            latest_candle_at: self.engine.latest_candle_at(),
            buffered: self
                .timeframes
                .iter()
                .map(|tf| (tf.label().to_string(), self.engine.buffered(tf)))
                .collect(),
            open_gaps: self.engine.open_gap_count(),
            zones: self.engine.zones().zones().len(),
            consecutive_errors: self.errors.consecutive(),
            cooling_until: self.errors.cooling_until(),
            signals_emitted: self.signals_emitted,
            last_signal_at: self.last_signal_at,
        });
    }

    /// Polls every `period` after `start_delay` until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown, start_delay: Duration, period: Duration) {
        let instrument = self.engine.instrument().to_string();
        let mut iv = interval_at(Instant::now() + start_delay, period);
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("{instrument}: worker started (every {period:?})");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = iv.tick() => {}
            }
            if shutdown.is_triggered() {
                break;
            }
            self.poll_once(&shutdown).await;
        }
        log::info!("{instrument}: worker stopped");
    }
}

// --- Scheduler -------------------------------------------------------

pub struct Scheduler {
    cfg: Arc<EngineConfig>,
    deps: EngineDeps,
    registry: StatusRegistry,
}

impl Scheduler {
    pub fn new(cfg: Arc<EngineConfig>, deps: EngineDeps, registry: StatusRegistry) -> Self {
        Self { cfg, deps, registry }
    }

    /// Spawns one worker per instrument, start-ups spread by `start_stagger`.
    pub fn spawn_all(&self, shutdown: Shutdown) -> Vec<JoinHandle<()>> {
        self.cfg
            .instruments
            .iter()
            .enumerate()
            .map(|(i, instrument)| {
                let engine = InstrumentEngine::new(instrument.clone(), Arc::clone(&self.cfg));
                let worker = InstrumentWorker::new(engine, &self.cfg, self.deps.clone(), self.registry.clone());
                self.registry.update(InstrumentStatus {
                    instrument: instrument.clone(),
                    last_outcome: "starting".into(),
                    ..Default::default()
                });
                let delay = self.cfg.start_stagger * i as u32;
                tokio::spawn(worker.run(shutdown.clone(), delay, self.cfg.poll_interval))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    // --- ErrorTracker ----------------------------------------

    #[test]
    fn cooldown_after_max_failures_then_reset() {
        let mut tr = ErrorTracker::new(3, ChronoDuration::seconds(300));
        assert!(!tr.record_failure(t(0)));
        assert!(!tr.record_failure(t(30)));
        assert!(tr.record_failure(t(60)));
        assert!(tr.is_cooling(t(61)));
        assert!(tr.is_cooling(t(359)));
        assert!(!tr.is_cooling(t(360)));
        assert_eq!(tr.consecutive(), 0);
        assert_eq!(tr.cooling_until(), None);
    }

    #[test]
    fn success_resets_the_streak() {
        let mut tr = ErrorTracker::new(2, ChronoDuration::seconds(60));
        tr.record_failure(t(0));
        tr.record_success();
        assert!(!tr.record_failure(t(1)));
        assert!(!tr.is_cooling(t(2)));
    }

    // --- Shutdown --------------------------------------------

    #[tokio::test]
    async fn shutdown_flag_propagates_to_clones() {
        let (trigger, shutdown) = shutdown_channel();
        let mut waiter = shutdown.clone();
        assert!(!shutdown.is_triggered());

        let handle = tokio::spawn(async move { waiter.wait().await });
        trigger.fire();
        handle.await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        assert!(shutdown.is_triggered());
        shutdown.wait().await;
    }

    // --- Registry --------------------------------------------

    #[test]
    fn registry_snapshot_is_sorted() {
        let reg = StatusRegistry::new();
        for name in ["GBPUSD-OTC", "AUDUSD-OTC", "EURUSD-OTC"] {
            reg.update(InstrumentStatus {
                instrument: name.into(),
                ..Default::default()
            });
        }
        let names: Vec<String> = reg.snapshot().into_iter().map(|s| s.instrument).collect();
        assert_eq!(names, vec!["AUDUSD-OTC", "EURUSD-OTC", "GBPUSD-OTC"]);
        assert!(reg.get("EURUSD-OTC").is_some());
    }
}
