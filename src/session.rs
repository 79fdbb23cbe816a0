//! Training session: merges the serial telemetry and heart rate streams
//! into a time-ordered series of per-second samples with summary
//! statistics and pause accounting.
//!
//! Samples are emitted to subscribers once per second while the session is
//! active; the session vector itself only grows by one entry per minute
//! (plus the terminal snapshot on stop), which keeps a multi-hour workout
//! small while the live emission still feeds real-time consumers.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use uuid::Uuid;

use crate::driver::{DriverEvent, S4Driver};
use crate::error::{Error, Result};
use crate::frame::epoch_ms;
use crate::hrm::{HeartRateSample, HrmClient};
use crate::registers::Sample;

/// Interval between sample emissions.
const EMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Every how many emission ticks a sample is appended to the session
/// vector.
const APPEND_EVERY_TICKS: u64 = 60;

/// Coefficient of the empirical rowing power model `P = 2.8 * v^3`.
const POWER_COEFFICIENT: f64 = 2.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Paused,
    Finished,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Finished => "finished",
        }
    }
}

/// Per-second snapshot of the session scratchpad. Optional fields stay
/// absent until their source has produced at least one value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSample {
    /// Wall-clock time of emission, epoch milliseconds.
    pub timestamp: u64,
    /// Seconds of active (non-paused) session time at emission.
    pub elapsed_s: u64,
    pub distance_m: Option<u32>,
    pub stroke_rate: Option<u32>,
    pub power_w: Option<f64>,
    pub calories: Option<u32>,
    pub heart_rate: Option<u16>,
    pub speed_mps: Option<f64>,
    pub total_strokes: Option<u32>,
}

/// Aggregate statistics over the session's sample vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub duration_s: u64,
    pub distance_m: Option<u32>,
    pub avg_heart_rate: Option<u16>,
    pub max_heart_rate: Option<u16>,
    pub avg_power_w: Option<f64>,
    pub max_power_w: Option<f64>,
    pub total_calories: Option<u32>,
    pub total_strokes: Option<u32>,
    pub sample_count: usize,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    Paused,
    Resumed,
    Stopped(SessionSummary),
    Datapoint(TrainingSample),
    Error(String),
}

/// Most recent value of every tracked quantity, updated as stream samples
/// arrive while the session is active.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Scratchpad {
    stroke_rate: Option<u32>,
    distance_m: Option<u32>,
    calories: Option<u32>,
    total_strokes: Option<u32>,
    speed_mps: Option<f64>,
    power_w: Option<f64>,
    heart_rate: Option<u16>,
}

impl Scratchpad {
    fn apply_register(&mut self, name: &str, value: u32) {
        match name {
            "stroke_rate" => self.stroke_rate = Some(value),
            // The monitor occasionally re-reports older values after a
            // reset request; distance never runs backwards.
            "distance" => {
                self.distance_m = Some(self.distance_m.map_or(value, |d| d.max(value)));
            }
            "total_kcal" => {
                let kcal = value / 1000;
                self.calories = Some(self.calories.map_or(kcal, |c| c.max(kcal)));
            }
            "strokes_cnt" => self.total_strokes = Some(value),
            "m_s_total" => {
                // Reported in cm/s.
                let speed = value as f64 / 100.0;
                self.speed_mps = Some(speed);
                if speed > 0.0 {
                    self.power_w = Some(POWER_COEFFICIENT * speed.powi(3));
                }
            }
            _ => {}
        }
    }

    fn apply_heart_rate(&mut self, bpm: u16) {
        self.heart_rate = Some(bpm);
    }
}

struct Core {
    state: SessionState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    start_mono: Option<Instant>,
    end_mono: Option<Instant>,
    pause_started: Option<Instant>,
    total_paused: Duration,
    scratch: Scratchpad,
    samples: Vec<TrainingSample>,
    ticks: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Core {
    fn new() -> Self {
        Core {
            state: SessionState::Idle,
            start_time: None,
            end_time: None,
            start_mono: None,
            end_mono: None,
            pause_started: None,
            total_paused: Duration::ZERO,
            scratch: Scratchpad::default(),
            samples: Vec::new(),
            ticks: 0,
            tasks: Vec::new(),
        }
    }

    /// Active session time so far, excluding completed and ongoing pauses.
    fn elapsed(&self) -> Duration {
        let Some(start) = self.start_mono else {
            return Duration::ZERO;
        };
        let end = self.end_mono.unwrap_or_else(Instant::now);
        let mut elapsed = end.duration_since(start).saturating_sub(self.total_paused);
        if let Some(pause) = self.pause_started {
            elapsed = elapsed.saturating_sub(end.duration_since(pause));
        }
        elapsed
    }

    fn duration_s(&self) -> u64 {
        self.elapsed().as_secs()
    }

    fn build_sample(&self) -> TrainingSample {
        TrainingSample {
            timestamp: epoch_ms(),
            elapsed_s: self.duration_s(),
            distance_m: self.scratch.distance_m,
            stroke_rate: self.scratch.stroke_rate,
            power_w: self.scratch.power_w,
            calories: self.scratch.calories,
            heart_rate: self.scratch.heart_rate,
            speed_mps: self.scratch.speed_mps,
            total_strokes: self.scratch.total_strokes,
        }
    }

    fn summary(&self) -> SessionSummary {
        summarize(&self.samples, self.duration_s())
    }
}

/// Compute summary statistics over a sample vector.
fn summarize(samples: &[TrainingSample], duration_s: u64) -> SessionSummary {
    let last = samples.last();

    let heart_rates: Vec<u16> = samples.iter().filter_map(|s| s.heart_rate).collect();
    let avg_heart_rate = (!heart_rates.is_empty()).then(|| {
        (heart_rates.iter().map(|&h| h as u64).sum::<u64>() / heart_rates.len() as u64) as u16
    });
    let max_heart_rate = heart_rates.iter().copied().max();

    let powers: Vec<f64> = samples.iter().filter_map(|s| s.power_w).collect();
    let avg_power_w =
        (!powers.is_empty()).then(|| powers.iter().sum::<f64>() / powers.len() as f64);
    let max_power_w = powers.iter().copied().fold(None, |acc: Option<f64>, p| {
        Some(acc.map_or(p, |a| a.max(p)))
    });

    SessionSummary {
        duration_s,
        distance_m: last.and_then(|s| s.distance_m),
        avg_heart_rate,
        max_heart_rate,
        avg_power_w,
        max_power_w,
        total_calories: last.and_then(|s| s.calories),
        total_strokes: last.and_then(|s| s.total_strokes),
        sample_count: samples.len(),
    }
}

struct Shared {
    id: Uuid,
    driver: S4Driver,
    hrm: HrmClient,
    events_tx: broadcast::Sender<SessionEvent>,
    core: StdMutex<Core>,
}

/// Handle to one training session. Cheap to clone; a session is one-shot:
/// once finished it never transitions again.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(driver: S4Driver, hrm: HrmClient) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Session {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                driver,
                hrm,
                events_tx,
                core: StdMutex::new(Core::new()),
            }),
        }
    }

    // --- observers ---

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.lock().unwrap().state
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.shared.core.lock().unwrap().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.shared.core.lock().unwrap().end_time
    }

    /// Seconds of active session time, excluding pauses.
    pub fn duration_s(&self) -> u64 {
        self.shared.core.lock().unwrap().duration_s()
    }

    pub fn samples(&self) -> Vec<TrainingSample> {
        self.shared.core.lock().unwrap().samples.clone()
    }

    /// Summary statistics computed on demand from the sample vector.
    pub fn summary(&self) -> SessionSummary {
        self.shared.core.lock().unwrap().summary()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    // --- lifecycle ---

    /// Begin the session: reset the monitor, subscribe to the telemetry
    /// streams and arm the per-second emission timer. Requires an idle
    /// session and a connected driver.
    pub async fn start(&self) -> Result<()> {
        {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != SessionState::Idle {
                return Err(Error::IllegalState {
                    operation: "start",
                    state: core.state.as_str(),
                });
            }
            if !self.shared.driver.is_connected() {
                return Err(Error::IllegalState {
                    operation: "start",
                    state: "driver_disconnected",
                });
            }
            core.state = SessionState::Active;
            core.start_time = Some(Utc::now());
            core.start_mono = Some(Instant::now());
            core.end_time = None;
            core.end_mono = None;
            core.pause_started = None;
            core.total_paused = Duration::ZERO;
            core.scratch = Scratchpad::default();
            core.samples.clear();
            core.ticks = 0;
        }

        // Start the workout from a clean monitor. A failed reset is not
        // fatal; the session continues with whatever the monitor streams.
        if let Err(e) = self.shared.driver.reset().await {
            warn!("monitor reset failed: {}", e);
        }

        let datapoints = self.shared.driver.subscribe_datapoints();
        let heart_rate = self.shared.hrm.subscribe_heart_rate();
        let driver_events = self.shared.driver.subscribe_events();

        let session = self.clone();
        let ingest =
            tokio::spawn(async move { session.ingest_loop(datapoints, heart_rate, driver_events).await });
        let session = self.clone();
        let emit = tokio::spawn(async move { session.emission_loop().await });

        self.shared.core.lock().unwrap().tasks = vec![ingest, emit];

        info!("session {} started", self.shared.id);
        let _ = self.shared.events_tx.send(SessionEvent::Started);
        Ok(())
    }

    /// Suspend sample collection and emission. Requires an active session.
    pub async fn pause(&self) -> Result<()> {
        {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != SessionState::Active {
                return Err(Error::IllegalState {
                    operation: "pause",
                    state: core.state.as_str(),
                });
            }
            core.pause_started = Some(Instant::now());
            core.state = SessionState::Paused;
        }
        info!("session {} paused", self.shared.id);
        let _ = self.shared.events_tx.send(SessionEvent::Paused);
        Ok(())
    }

    /// Resume a paused session, accounting the wall time spent paused.
    pub async fn resume(&self) -> Result<()> {
        {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != SessionState::Paused {
                return Err(Error::IllegalState {
                    operation: "resume",
                    state: core.state.as_str(),
                });
            }
            if let Some(pause) = core.pause_started.take() {
                core.total_paused += Instant::now().duration_since(pause);
            }
            core.state = SessionState::Active;
        }
        info!("session {} resumed", self.shared.id);
        let _ = self.shared.events_tx.send(SessionEvent::Resumed);
        Ok(())
    }

    /// Finish the session: emit the terminal snapshot, detach from all
    /// streams, close the driver and the heart rate monitor, and return
    /// the sample vector.
    pub async fn stop(&self) -> Result<Vec<TrainingSample>> {
        let (samples, summary) = {
            let mut core = self.shared.core.lock().unwrap();
            if !matches!(core.state, SessionState::Active | SessionState::Paused) {
                return Err(Error::IllegalState {
                    operation: "stop",
                    state: core.state.as_str(),
                });
            }
            if let Some(pause) = core.pause_started.take() {
                core.total_paused += Instant::now().duration_since(pause);
            }
            core.state = SessionState::Finished;
            core.end_mono = Some(Instant::now());
            core.end_time = Some(Utc::now());

            let terminal = core.build_sample();
            core.samples.push(terminal.clone());
            let _ = self
                .shared
                .events_tx
                .send(SessionEvent::Datapoint(terminal));

            for task in core.tasks.drain(..) {
                task.abort();
            }
            (core.samples.clone(), core.summary())
        };

        self.shared.driver.close().await;
        self.shared.hrm.disconnect().await;

        info!(
            "session {} stopped after {} s, {} samples",
            self.shared.id, summary.duration_s, summary.sample_count
        );
        let _ = self.shared.events_tx.send(SessionEvent::Stopped(summary));
        Ok(samples)
    }

    // --- stream handling ---

    async fn ingest_loop(
        &self,
        mut datapoints: broadcast::Receiver<Sample>,
        mut heart_rate: broadcast::Receiver<HeartRateSample>,
        mut driver_events: broadcast::Receiver<DriverEvent>,
    ) {
        let mut heart_rate_open = true;
        loop {
            tokio::select! {
                res = datapoints.recv() => match res {
                    Ok(sample) => self.apply_register_sample(&sample),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("session lagged on datapoints, {} dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                res = heart_rate.recv(), if heart_rate_open => match res {
                    Ok(sample) => self.apply_heart_rate(sample),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("session lagged on heart rate, {} dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => heart_rate_open = false,
                },
                res = driver_events.recv() => match res {
                    Ok(DriverEvent::Closed) => {
                        self.finish_on_driver_close();
                        break;
                    }
                    Ok(DriverEvent::Error(e)) => {
                        let _ = self.shared.events_tx.send(SessionEvent::Error(e));
                    }
                    Ok(DriverEvent::Initialised) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    fn apply_register_sample(&self, sample: &Sample) {
        let mut core = self.shared.core.lock().unwrap();
        if core.state != SessionState::Active {
            return;
        }
        core.scratch.apply_register(sample.name, sample.value);
    }

    fn apply_heart_rate(&self, sample: HeartRateSample) {
        let mut core = self.shared.core.lock().unwrap();
        if core.state != SessionState::Active {
            return;
        }
        core.scratch.apply_heart_rate(sample.bpm);
    }

    /// The driver released the port while the session was running.
    fn finish_on_driver_close(&self) {
        let summary = {
            let mut core = self.shared.core.lock().unwrap();
            if !matches!(core.state, SessionState::Active | SessionState::Paused) {
                return;
            }
            if let Some(pause) = core.pause_started.take() {
                core.total_paused += Instant::now().duration_since(pause);
            }
            core.state = SessionState::Finished;
            core.end_mono = Some(Instant::now());
            core.end_time = Some(Utc::now());
            let terminal = core.build_sample();
            core.samples.push(terminal.clone());
            let _ = self
                .shared
                .events_tx
                .send(SessionEvent::Datapoint(terminal));
            core.summary()
        };
        warn!(
            "S4 driver closed mid-session, finishing session {}",
            self.shared.id
        );
        let _ = self.shared.events_tx.send(SessionEvent::Stopped(summary));
    }

    async fn emission_loop(&self) {
        let mut ticker = interval(EMIT_INTERVAL);
        // Skip the immediate first tick; the first sample is emitted one
        // full second into the session.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (sample, done) = {
                let mut core = self.shared.core.lock().unwrap();
                match core.state {
                    SessionState::Finished | SessionState::Idle => (None, true),
                    SessionState::Paused => (None, false),
                    SessionState::Active => {
                        let sample = core.build_sample();
                        core.ticks += 1;
                        if core.ticks % APPEND_EVERY_TICKS == 0 {
                            core.samples.push(sample.clone());
                        }
                        (Some(sample), false)
                    }
                }
            };
            if done {
                break;
            }
            if let Some(sample) = sample {
                let _ = self.shared.events_tx.send(SessionEvent::Datapoint(sample));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratchpad_tracks_stroke_rate_and_strokes() {
        let mut pad = Scratchpad::default();
        pad.apply_register("stroke_rate", 24);
        pad.apply_register("strokes_cnt", 120);
        assert_eq!(pad.stroke_rate, Some(24));
        assert_eq!(pad.total_strokes, Some(120));
    }

    #[test]
    fn scratchpad_distance_is_monotone() {
        let mut pad = Scratchpad::default();
        let readings = [5u32, 10, 8, 20, 3, 20, 21, 0];
        let mut best = 0u32;
        for value in readings {
            pad.apply_register("distance", value);
            best = best.max(value);
            assert_eq!(pad.distance_m, Some(best), "after value {value}");
        }
    }

    #[test]
    fn scratchpad_calories_scaled_and_monotone() {
        let mut pad = Scratchpad::default();
        pad.apply_register("total_kcal", 45_000);
        assert_eq!(pad.calories, Some(45));
        pad.apply_register("total_kcal", 44_000);
        assert_eq!(pad.calories, Some(45));
        pad.apply_register("total_kcal", 46_500);
        assert_eq!(pad.calories, Some(46));
    }

    #[test]
    fn scratchpad_speed_drives_power_model() {
        let mut pad = Scratchpad::default();
        pad.apply_register("m_s_total", 200); // 2.00 m/s
        assert_eq!(pad.speed_mps, Some(2.0));
        let power = pad.power_w.unwrap();
        assert!((power - 22.4).abs() < 1e-9, "2.8 * 2^3 = 22.4, got {power}");
    }

    #[test]
    fn scratchpad_zero_speed_keeps_last_power() {
        let mut pad = Scratchpad::default();
        pad.apply_register("m_s_total", 300);
        let power = pad.power_w;
        pad.apply_register("m_s_total", 0);
        assert_eq!(pad.speed_mps, Some(0.0));
        assert_eq!(pad.power_w, power);
    }

    #[test]
    fn scratchpad_ignores_unmapped_registers() {
        let mut pad = Scratchpad::default();
        pad.apply_register("tank_volume", 55);
        pad.apply_register("mph", 123);
        assert_eq!(pad, Scratchpad::default());
    }

    #[test]
    fn scratchpad_heart_rate_is_last_value() {
        let mut pad = Scratchpad::default();
        pad.apply_heart_rate(120);
        pad.apply_heart_rate(140);
        assert_eq!(pad.heart_rate, Some(140));
    }

    fn sample_with(
        heart_rate: Option<u16>,
        power_w: Option<f64>,
        distance_m: Option<u32>,
    ) -> TrainingSample {
        TrainingSample {
            timestamp: 0,
            elapsed_s: 0,
            distance_m,
            stroke_rate: None,
            power_w,
            calories: None,
            heart_rate,
            speed_mps: None,
            total_strokes: None,
        }
    }

    #[test]
    fn summarize_empty_vector() {
        let summary = summarize(&[], 0);
        assert_eq!(summary.sample_count, 0);
        assert_eq!(summary.distance_m, None);
        assert_eq!(summary.avg_heart_rate, None);
        assert_eq!(summary.max_power_w, None);
    }

    #[test]
    fn summarize_statistics() {
        let samples = vec![
            sample_with(Some(100), Some(50.0), Some(100)),
            sample_with(Some(140), Some(150.0), Some(500)),
            sample_with(None, None, Some(900)),
            sample_with(Some(120), Some(100.0), Some(1000)),
        ];
        let summary = summarize(&samples, 240);
        assert_eq!(summary.duration_s, 240);
        assert_eq!(summary.sample_count, 4);
        assert_eq!(summary.distance_m, Some(1000));
        assert_eq!(summary.avg_heart_rate, Some(120));
        assert_eq!(summary.max_heart_rate, Some(140));
        assert_eq!(summary.avg_power_w, Some(100.0));
        assert_eq!(summary.max_power_w, Some(150.0));
    }

    #[test]
    fn new_session_is_idle_with_unique_id() {
        let driver = S4Driver::new(crate::driver::DriverConfig::default());
        let hrm = HrmClient::new(Arc::new(NeverAdapter));
        let a = Session::new(driver.clone(), hrm.clone());
        let b = Session::new(driver, hrm);
        assert_eq!(a.state(), SessionState::Idle);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.duration_s(), 0);
    }

    #[tokio::test]
    async fn lifecycle_guards_reject_wrong_states() {
        let driver = S4Driver::new(crate::driver::DriverConfig::default());
        let hrm = HrmClient::new(Arc::new(NeverAdapter));
        let session = Session::new(driver, hrm);

        // Driver is disconnected: start must fail without side effects.
        assert!(matches!(
            session.start().await,
            Err(Error::IllegalState { operation: "start", .. })
        ));
        assert_eq!(session.state(), SessionState::Idle);

        assert!(matches!(
            session.pause().await,
            Err(Error::IllegalState { operation: "pause", .. })
        ));
        assert!(matches!(
            session.resume().await,
            Err(Error::IllegalState { operation: "resume", .. })
        ));
        assert!(matches!(
            session.stop().await,
            Err(Error::IllegalState { operation: "stop", .. })
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.samples().is_empty());
    }

    /// Central adapter that never finds anything; good enough for tests
    /// that never touch BLE.
    struct NeverAdapter;

    #[async_trait::async_trait]
    impl crate::ble::CentralAdapter for NeverAdapter {
        async fn wait_powered_on(&self) -> Result<()> {
            Ok(())
        }

        async fn scan(
            &self,
            _service: uuid::Uuid,
            _window: Duration,
        ) -> Result<Vec<crate::ble::DiscoveredDevice>> {
            Ok(Vec::new())
        }

        async fn connect(
            &self,
            device_id: &str,
        ) -> Result<Box<dyn crate::ble::PeripheralLink>> {
            Err(Error::BleServiceNotFound(device_id.to_string()))
        }
    }
}
