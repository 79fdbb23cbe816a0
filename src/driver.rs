//! S4 serial driver.
//!
//! Owns the serial port and the register table, performs the `USB`
//! handshake, schedules register polling, and fans the decoded telemetry
//! out on broadcast channels. The transport is any `AsyncRead + AsyncWrite`
//! stream so tests can drive the driver through an in-memory duplex pipe;
//! production uses a `tokio_serial` port found by USB descriptor.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

use crate::error::{Error, Result};
use crate::frame::{self, classify, Frame, RawRead};
use crate::recording;
use crate::registers::{RegisterDef, RegisterTable, Sample};

const BAUD_RATE: u32 = 19200;

/// USB manufacturer strings the S4's CDC ACM interface reports.
const S4_MANUFACTURERS: [&str; 2] = [
    "Microchip Technology, Inc.",
    "Microchip Technology Inc.",
];

/// Spacing between requests within one polling batch, so the monitor's
/// input buffer is never flooded.
const REQUEST_SPACING: Duration = Duration::from_millis(50);

/// Transport the driver reads frames from and writes commands to.
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialLink for T {}

/// Driver lifecycle. `Ready` is absorbing for the service lifetime;
/// it is left only on serial error, peer hang-up or an explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Opening,
    Initialising,
    Ready,
    Closing,
}

impl DriverState {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverState::Disconnected => "disconnected",
            DriverState::Opening => "opening",
            DriverState::Initialising => "initialising",
            DriverState::Ready => "ready",
            DriverState::Closing => "closing",
        }
    }
}

/// Lifecycle notifications published alongside the data streams.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// The monitor answered the `USB` handshake.
    Initialised,
    /// The driver released the port (explicitly or after an error).
    Closed,
    Error(String),
}

/// Driver settings, usually derived from [`crate::config::GatewayConfig`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Serial port path; `None` autodetects by USB manufacturer.
    pub serial_port: Option<String>,
    /// Polling interval; zero disables the polling timer.
    pub refresh_interval: Duration,
    /// Register names requested on every polling tick.
    pub poll_registers: Vec<String>,
    /// Directory holding recording files.
    pub data_dir: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            serial_port: None,
            refresh_interval: Duration::from_millis(200),
            poll_registers: crate::config::GatewayConfig::default().poll_registers,
            data_dir: PathBuf::from("data"),
        }
    }
}

// Display selector wire codes.

/// What the monitor's distance window shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceDisplay {
    Meters,
    Miles,
    Kilometers,
    Strokes,
}

impl DistanceDisplay {
    pub fn code(self) -> &'static str {
        match self {
            DistanceDisplay::Meters => "ME",
            DistanceDisplay::Miles => "MI",
            DistanceDisplay::Kilometers => "KM",
            DistanceDisplay::Strokes => "ST",
        }
    }
}

/// What the monitor's intensity window shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntensityDisplay {
    MetersPerSecond,
    Mph,
    Per500m,
    Per2km,
    Watts,
    CaloriesPerHour,
}

impl IntensityDisplay {
    pub fn code(self) -> &'static str {
        match self {
            IntensityDisplay::MetersPerSecond => "MS",
            IntensityDisplay::Mph => "MPH",
            IntensityDisplay::Per500m => "500",
            IntensityDisplay::Per2km => "2KM",
            IntensityDisplay::Watts => "WA",
            IntensityDisplay::CaloriesPerHour => "CH",
        }
    }
}

/// What the monitor's average-intensity window shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AverageIntensityDisplay {
    MetersPerSecond,
    Mph,
    Per500m,
    Per2km,
}

impl AverageIntensityDisplay {
    pub fn code(self) -> &'static str {
        match self {
            AverageIntensityDisplay::MetersPerSecond => "MS",
            AverageIntensityDisplay::Mph => "MPH",
            AverageIntensityDisplay::Per500m => "500",
            AverageIntensityDisplay::Per2km => "2KM",
        }
    }
}

/// Unit code for a distance workout definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkoutUnit {
    Meters = 1,
    Miles = 2,
    Kilometers = 3,
    Strokes = 4,
}

// Pure command builders, unit-tested below.

fn request_line(def: &RegisterDef) -> String {
    format!("IR{}{}", def.width.tag(), def.address)
}

fn distance_workout_line(units: WorkoutUnit, amount: u16) -> String {
    format!("WSI{}{:04X}", units as u8, amount)
}

fn duration_workout_line(seconds: u16) -> String {
    format!("WSU{:04X}", seconds)
}

struct Shared {
    config: DriverConfig,
    table: RegisterTable,
    state: StdMutex<DriverState>,
    port_name: StdMutex<Option<String>>,
    writer: Mutex<Option<WriteHalf<Box<dyn SerialLink>>>>,
    reads_tx: broadcast::Sender<RawRead>,
    datapoints_tx: broadcast::Sender<Sample>,
    events_tx: broadcast::Sender<DriverEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    recording: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to the S4 driver. Cheap to clone; all clones share one port.
#[derive(Clone)]
pub struct S4Driver {
    shared: Arc<Shared>,
}

impl S4Driver {
    pub fn new(config: DriverConfig) -> Self {
        let (reads_tx, _) = broadcast::channel(256);
        let (datapoints_tx, _) = broadcast::channel(256);
        let (events_tx, _) = broadcast::channel(16);
        S4Driver {
            shared: Arc::new(Shared {
                config,
                table: RegisterTable::new(),
                state: StdMutex::new(DriverState::Disconnected),
                port_name: StdMutex::new(None),
                writer: Mutex::new(None),
                reads_tx,
                datapoints_tx,
                events_tx,
                tasks: StdMutex::new(Vec::new()),
                recording: StdMutex::new(None),
            }),
        }
    }

    // --- observers ---

    pub fn state(&self) -> DriverState {
        *self.shared.state.lock().unwrap()
    }

    /// True from the moment the port is open (handshake may still be in
    /// flight); the `Initialised` event signals full readiness.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            DriverState::Initialising | DriverState::Ready
        )
    }

    pub fn port_name(&self) -> Option<String> {
        self.shared.port_name.lock().unwrap().clone()
    }

    /// Every classified frame, as it arrived on the wire.
    pub fn subscribe_reads(&self) -> broadcast::Receiver<RawRead> {
        self.shared.reads_tx.subscribe()
    }

    /// Decoded register samples.
    pub fn subscribe_datapoints(&self) -> broadcast::Receiver<Sample> {
        self.shared.datapoints_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Synchronous read of cached register values.
    pub fn read_datapoints(&self, subset: Option<&[String]>) -> Vec<(&'static str, u32)> {
        self.shared.table.snapshot(subset)
    }

    pub fn read_current(&self, name: &str) -> Option<u32> {
        self.shared.table.read_current(name)
    }

    // --- lifecycle ---

    /// Open the configured serial port, or the first port whose USB
    /// descriptor matches the WaterRower's, and start the handshake.
    /// A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if *st != DriverState::Disconnected {
                return Ok(());
            }
            *st = DriverState::Opening;
        }

        let port = match &self.shared.config.serial_port {
            Some(p) => p.clone(),
            None => match autodetect_port() {
                Ok(p) => p,
                Err(e) => {
                    *self.shared.state.lock().unwrap() = DriverState::Disconnected;
                    return Err(e);
                }
            },
        };

        info!("opening S4 serial port {} at {} baud", port, BAUD_RATE);
        let stream = match tokio_serial::new(&port, BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
        {
            Ok(s) => s,
            Err(e) => {
                *self.shared.state.lock().unwrap() = DriverState::Disconnected;
                return Err(e.into());
            }
        };

        self.connect_with_stream(Box::new(stream), Some(port)).await
    }

    /// Attach an already-open transport. This is the seam the scenario
    /// tests use with `tokio::io::duplex`; `connect` funnels through it.
    pub async fn connect_with_stream(
        &self,
        io: Box<dyn SerialLink>,
        port_name: Option<String>,
    ) -> Result<()> {
        {
            let mut st = self.shared.state.lock().unwrap();
            match *st {
                DriverState::Disconnected | DriverState::Opening => {
                    *st = DriverState::Initialising;
                }
                _ => return Ok(()),
            }
        }
        *self.shared.port_name.lock().unwrap() = port_name;

        let (read_half, write_half) = tokio::io::split(io);
        *self.shared.writer.lock().await = Some(write_half);

        // Ask the monitor to start streaming; its hardware-type reply
        // flips the driver to ready.
        self.write_line("USB").await?;

        let shared = self.shared.clone();
        let handle = tokio::spawn(reader_loop(shared, read_half));
        self.shared.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    /// Reset the monitor and re-issue the streaming handshake.
    pub async fn reset(&self) -> Result<()> {
        self.write_line("RESET").await?;
        self.write_line("USB").await
    }

    /// Send `EXIT`, stop polling and recording, release the port and
    /// complete the event stream with `Closed`. Idempotent.
    pub async fn close(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if matches!(*st, DriverState::Disconnected | DriverState::Closing) {
                return;
            }
            *st = DriverState::Closing;
        }
        info!("closing S4 driver");

        {
            let mut guard = self.shared.writer.lock().await;
            if let Some(w) = guard.as_mut() {
                let _ = w.write_all(b"EXIT\r\n").await;
                let _ = w.flush().await;
                let _ = w.shutdown().await;
            }
            *guard = None;
        }

        self.stop_recording();

        let tasks: Vec<_> = self.shared.tasks.lock().unwrap().drain(..).collect();
        for t in tasks {
            t.abort();
        }

        let _ = self.shared.events_tx.send(DriverEvent::Closed);
        *self.shared.state.lock().unwrap() = DriverState::Disconnected;
        *self.shared.port_name.lock().unwrap() = None;
    }

    // --- commands ---

    /// Request a batch of register reads, spaced [`REQUEST_SPACING`]
    /// apart. With `None`, the configured polling set is requested.
    pub async fn request_datapoints(&self, subset: Option<&[String]>) -> Result<()> {
        let names = subset.unwrap_or(&self.shared.config.poll_registers);
        let defs: Vec<&RegisterDef> = names
            .iter()
            .filter_map(|n| {
                let def = self.shared.table.def_by_name(n);
                if def.is_none() {
                    warn!("ignoring unknown register {:?} in request batch", n);
                }
                def
            })
            .collect();

        for (i, def) in defs.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(REQUEST_SPACING).await;
            }
            self.write_line(&request_line(def)).await?;
        }
        Ok(())
    }

    /// Program a distance workout on the monitor.
    pub async fn define_distance_workout(&self, amount: u16, units: WorkoutUnit) -> Result<()> {
        self.write_line(&distance_workout_line(units, amount)).await
    }

    /// Program a duration workout, in seconds.
    pub async fn define_duration_workout(&self, seconds: u16) -> Result<()> {
        self.write_line(&duration_workout_line(seconds)).await
    }

    pub async fn display_set_distance(&self, units: DistanceDisplay) -> Result<()> {
        self.write_line(&format!("DD{}", units.code())).await
    }

    pub async fn display_set_intensity(&self, display: IntensityDisplay) -> Result<()> {
        self.write_line(&format!("DD{}", display.code())).await
    }

    pub async fn display_set_average_intensity(
        &self,
        display: AverageIntensityDisplay,
    ) -> Result<()> {
        self.write_line(&format!("DD{}", display.code())).await
    }

    // --- record & replay ---

    /// Start appending every non-pulse read to a recording file,
    /// truncating any previous recording of the same name.
    pub async fn start_recording(&self, name: Option<&str>) -> Result<()> {
        self.stop_recording();
        let path = recording::file_path(&self.shared.config.data_dir, name);
        let file = recording::create(&path).await?;
        let rx = self.shared.reads_tx.subscribe();
        info!("recording serial reads to {}", path.display());
        let handle = tokio::spawn(recording::record(file, rx));
        *self.shared.recording.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Detach the recording subscription. Idempotent.
    pub fn stop_recording(&self) {
        if let Some(h) = self.shared.recording.lock().unwrap().take() {
            h.abort();
            info!("recording stopped");
        }
    }

    /// Replay a recording through the live ingest path, preserving the
    /// inter-arrival gaps between recorded reads. Resolves when the last
    /// read has been republished.
    pub async fn play_recording(&self, name: Option<&str>) -> Result<()> {
        let path = recording::file_path(&self.shared.config.data_dir, name);
        let shared = self.shared.clone();
        recording::replay(&path, move |raw| ingest_raw(&shared, raw)).await
    }

    // --- internals ---

    /// Write one CR/LF-terminated command. A no-op after close; a serial
    /// error publishes `Error` and closes the driver.
    async fn write_line(&self, cmd: &str) -> Result<()> {
        let mut guard = self.shared.writer.lock().await;
        let Some(w) = guard.as_mut() else {
            return Ok(());
        };
        let mut buf = Vec::with_capacity(cmd.len() + 2);
        buf.extend_from_slice(cmd.as_bytes());
        buf.extend_from_slice(b"\r\n");

        let res = async {
            w.write_all(&buf).await?;
            w.flush().await
        }
        .await;

        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                error!("serial write failed: {}", e);
                let _ = self
                    .shared
                    .events_tx
                    .send(DriverEvent::Error(e.to_string()));
                let driver = self.clone();
                tokio::spawn(async move { driver.close().await });
                Err(Error::SerialIo(e))
            }
        }
    }
}

/// Locate the S4 by USB manufacturer descriptor.
fn autodetect_port() -> Result<String> {
    let ports = tokio_serial::available_ports()?;
    for port in &ports {
        if let SerialPortType::UsbPort(info) = &port.port_type {
            if let Some(manufacturer) = &info.manufacturer {
                if S4_MANUFACTURERS.contains(&manufacturer.as_str()) {
                    info!(
                        "found WaterRower S4 on {} ({})",
                        port.port_name, manufacturer
                    );
                    return Ok(port.port_name.clone());
                }
            }
        }
    }
    Err(Error::NoDeviceFound)
}

async fn reader_loop(
    shared: Arc<Shared>,
    read_half: tokio::io::ReadHalf<Box<dyn SerialLink>>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches('\r');
                ingest_line(&shared, frame::epoch_ms(), line);
            }
            Ok(None) => {
                info!("serial stream ended (peer hang-up)");
                break;
            }
            Err(e) => {
                error!("serial read failed: {}", e);
                let _ = shared.events_tx.send(DriverEvent::Error(e.to_string()));
                break;
            }
        }
    }

    // Close from a detached task: `close` aborts the reader's own join
    // handle, which must not cancel the cleanup itself.
    let driver = S4Driver { shared };
    tokio::spawn(async move { driver.close().await });
}

fn ingest_line(shared: &Arc<Shared>, time: u64, line: &str) {
    let frame = classify(line);
    let raw = RawRead {
        time,
        kind: frame.kind(),
        data: line.to_string(),
    };
    publish(shared, raw, frame);
}

fn ingest_raw(shared: &Arc<Shared>, raw: RawRead) {
    let frame = classify(&raw.data);
    publish(shared, raw, frame);
}

fn publish(shared: &Arc<Shared>, raw: RawRead, frame: Frame) {
    let time = raw.time;
    let _ = shared.reads_tx.send(raw);

    match frame {
        Frame::Datapoint(dp) => match shared.table.decode(&dp, time) {
            Ok(sample) => {
                let _ = shared.datapoints_tx.send(sample);
            }
            Err(e) => warn!("dropping datapoint frame: {}", e),
        },
        Frame::HardwareType => on_initialised(shared),
        Frame::Pulse | Frame::Other => {}
    }
}

fn on_initialised(shared: &Arc<Shared>) {
    let newly_ready = {
        let mut st = shared.state.lock().unwrap();
        if *st == DriverState::Initialising {
            *st = DriverState::Ready;
            true
        } else {
            false
        }
    };
    if !newly_ready {
        return;
    }

    info!("S4 monitor initialised, driver ready");
    let _ = shared.events_tx.send(DriverEvent::Initialised);

    let refresh = shared.config.refresh_interval;
    if refresh.is_zero() {
        return;
    }

    let driver = S4Driver {
        shared: shared.clone(),
    };
    let handle = tokio::spawn(async move {
        let mut ticker = interval(refresh);
        // The first tick of a tokio interval fires immediately; polling
        // starts one full interval after readiness.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if driver.state() != DriverState::Ready {
                break;
            }
            if driver.request_datapoints(None).await.is_err() {
                break;
            }
        }
    });
    shared.tasks.lock().unwrap().push(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Width;

    fn def(name: &str) -> &'static RegisterDef {
        crate::registers::REGISTERS
            .iter()
            .find(|d| d.name == name)
            .unwrap()
    }

    #[test]
    fn request_lines_carry_width_tag_and_address() {
        assert_eq!(request_line(def("stroke_rate")), "IRS1A9");
        assert_eq!(request_line(def("kcal_watts")), "IRD088");
        assert_eq!(request_line(def("distance")), "IRD057");
        assert_eq!(def("stroke_rate").width, Width::Single);
    }

    #[test]
    fn distance_workout_is_zero_padded_uppercase_hex() {
        assert_eq!(
            distance_workout_line(WorkoutUnit::Meters, 2000),
            "WSI107D0"
        );
        assert_eq!(distance_workout_line(WorkoutUnit::Strokes, 10), "WSI4000A");
        assert_eq!(
            distance_workout_line(WorkoutUnit::Kilometers, 0xBEEF),
            "WSI3BEEF"
        );
    }

    #[test]
    fn duration_workout_is_zero_padded_uppercase_hex() {
        assert_eq!(duration_workout_line(300), "WSU012C");
        assert_eq!(duration_workout_line(0), "WSU0000");
        assert_eq!(duration_workout_line(u16::MAX), "WSUFFFF");
    }

    #[test]
    fn display_codes() {
        assert_eq!(DistanceDisplay::Meters.code(), "ME");
        assert_eq!(DistanceDisplay::Miles.code(), "MI");
        assert_eq!(DistanceDisplay::Kilometers.code(), "KM");
        assert_eq!(DistanceDisplay::Strokes.code(), "ST");
        assert_eq!(IntensityDisplay::MetersPerSecond.code(), "MS");
        assert_eq!(IntensityDisplay::Mph.code(), "MPH");
        assert_eq!(IntensityDisplay::Per500m.code(), "500");
        assert_eq!(IntensityDisplay::Per2km.code(), "2KM");
        assert_eq!(IntensityDisplay::Watts.code(), "WA");
        assert_eq!(IntensityDisplay::CaloriesPerHour.code(), "CH");
        assert_eq!(AverageIntensityDisplay::Per500m.code(), "500");
    }

    #[test]
    fn initial_state_is_disconnected() {
        let driver = S4Driver::new(DriverConfig::default());
        assert_eq!(driver.state(), DriverState::Disconnected);
        assert!(!driver.is_connected());
        assert_eq!(driver.port_name(), None);
    }

    #[tokio::test]
    async fn write_after_close_is_a_no_op() {
        let driver = S4Driver::new(DriverConfig::default());
        // Never connected: commands must silently do nothing.
        driver.reset().await.unwrap();
        driver
            .request_datapoints(Some(&["stroke_rate".to_string()]))
            .await
            .unwrap();
        driver.close().await;
        driver.close().await; // idempotent
    }

    #[tokio::test]
    async fn read_datapoints_reflects_ingested_values() {
        let driver = S4Driver::new(DriverConfig::default());
        ingest_line(&driver.shared, 0, "IDS1A912");
        ingest_line(&driver.shared, 0, "IDD08800C8");
        assert_eq!(driver.read_current("stroke_rate"), Some(18));
        assert_eq!(driver.read_current("kcal_watts"), Some(200));
        let snap = driver.read_datapoints(Some(&["stroke_rate".to_string()]));
        assert_eq!(snap, vec![("stroke_rate", 18)]);
    }
}
