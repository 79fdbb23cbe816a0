//! BLE heart rate monitor client.
//!
//! Scans for peripherals advertising the Heart Rate Service (0x180D),
//! connects, subscribes to Heart Rate Measurement notifications (0x2A37)
//! and republishes the parsed readings on a broadcast stream. Written
//! against [`CentralAdapter`] so the same client runs over BlueZ in
//! production and over mock adapters in tests.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::ble::{
    CentralAdapter, DiscoveredDevice, PeripheralLink, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
    DEVICE_NAME_UUID, GAP_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};
use crate::error::{Error, Result};
use crate::frame::epoch_ms;

/// Length of one discovery scan.
pub const SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Deadline for a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many times [`HrmClient::reconnect`] tries before giving up.
pub const RECONNECT_ATTEMPTS: u32 = 30;

/// Fallback when the peer has no readable Device Name characteristic.
const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Central client lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrmState {
    Idle,
    WaitingForAdapter,
    Scanning,
    Connecting,
    Connected,
    Subscribed,
    Disconnected,
}

impl HrmState {
    pub fn as_str(self) -> &'static str {
        match self {
            HrmState::Idle => "idle",
            HrmState::WaitingForAdapter => "waiting_for_adapter",
            HrmState::Scanning => "scanning",
            HrmState::Connecting => "connecting",
            HrmState::Connected => "connected",
            HrmState::Subscribed => "subscribed",
            HrmState::Disconnected => "disconnected",
        }
    }
}

/// One heart rate reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    pub time_ms: u64,
    pub bpm: u16,
}

/// Connection notifications for observers (the session does not need
/// these; it just reads the sample stream).
#[derive(Debug, Clone)]
pub enum HrmEvent {
    Connected { device_name: String },
    Disconnected,
}

/// Parse a Heart Rate Measurement value.
///
/// Byte 0 is a flags byte; bit 0 selects the rate encoding: 0 means an
/// unsigned byte at offset 1, 1 means an unsigned 16-bit little-endian
/// value at offsets 1-2. The remaining flag bits (sensor contact, energy
/// expended, RR intervals) do not affect the rate and are ignored.
pub fn parse_hr_measurement(data: &[u8]) -> Option<u16> {
    let flags = *data.first()?;
    if flags & 0x01 != 0 {
        if data.len() < 3 {
            return None;
        }
        Some(u16::from_le_bytes([data[1], data[2]]))
    } else {
        data.get(1).map(|&b| b as u16)
    }
}

struct Shared {
    adapter: Arc<dyn CentralAdapter>,
    state: StdMutex<HrmState>,
    device_name: StdMutex<Option<String>>,
    battery_level: StdMutex<Option<u8>>,
    link: Mutex<Option<Box<dyn PeripheralLink>>>,
    hr_tx: broadcast::Sender<HeartRateSample>,
    events_tx: broadcast::Sender<HrmEvent>,
    sub_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to the heart rate monitor client. Cheap to clone.
#[derive(Clone)]
pub struct HrmClient {
    shared: Arc<Shared>,
}

impl HrmClient {
    pub fn new(adapter: Arc<dyn CentralAdapter>) -> Self {
        let (hr_tx, _) = broadcast::channel(64);
        let (events_tx, _) = broadcast::channel(16);
        HrmClient {
            shared: Arc::new(Shared {
                adapter,
                state: StdMutex::new(HrmState::Idle),
                device_name: StdMutex::new(None),
                battery_level: StdMutex::new(None),
                link: Mutex::new(None),
                hr_tx,
                events_tx,
                sub_task: StdMutex::new(None),
            }),
        }
    }

    // --- observers ---

    pub fn state(&self) -> HrmState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), HrmState::Connected | HrmState::Subscribed)
    }

    pub fn device_name(&self) -> Option<String> {
        self.shared.device_name.lock().unwrap().clone()
    }

    pub fn battery_level(&self) -> Option<u8> {
        *self.shared.battery_level.lock().unwrap()
    }

    pub fn subscribe_heart_rate(&self) -> broadcast::Receiver<HeartRateSample> {
        self.shared.hr_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HrmEvent> {
        self.shared.events_tx.subscribe()
    }

    // --- operations ---

    /// Scan for heart rate monitors for [`SCAN_WINDOW`] and return every
    /// device seen, deduplicated by id.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        self.guard_not_connected("discover")?;

        self.set_state(HrmState::WaitingForAdapter);
        if let Err(e) = self.shared.adapter.wait_powered_on().await {
            self.set_state(HrmState::Idle);
            return Err(e);
        }

        self.set_state(HrmState::Scanning);
        let result = self
            .shared
            .adapter
            .scan(HEART_RATE_SERVICE_UUID, SCAN_WINDOW)
            .await;
        self.set_state(HrmState::Idle);

        let mut devices = result?;
        let mut seen = std::collections::HashSet::new();
        devices.retain(|d| seen.insert(d.id.clone()));
        info!("discovery found {} heart rate device(s)", devices.len());
        Ok(devices)
    }

    /// Connect directly to a device by id (no scan), read its name and
    /// battery level where offered, and subscribe to heart rate
    /// notifications.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        self.guard_not_connected("connect")?;

        self.set_state(HrmState::WaitingForAdapter);
        match self.connect_inner(device_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(HrmState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, device_id: &str) -> Result<()> {
        self.shared.adapter.wait_powered_on().await?;

        self.set_state(HrmState::Connecting);
        info!("connecting to heart rate monitor {}", device_id);
        let link = tokio::time::timeout(CONNECT_TIMEOUT, self.shared.adapter.connect(device_id))
            .await
            .map_err(|_| Error::BleConnectTimeout(CONNECT_TIMEOUT))??;
        self.set_state(HrmState::Connected);

        let name = match link
            .read_characteristic(GAP_SERVICE_UUID, DEVICE_NAME_UUID)
            .await
        {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => UNKNOWN_DEVICE.to_string(),
        };

        // Battery level is optional; absence is not an error.
        let battery = match link
            .read_characteristic(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)
            .await
        {
            Ok(Some(bytes)) => bytes.first().copied(),
            _ => None,
        };

        info!(
            "connected to {} ({}), battery {}",
            name,
            device_id,
            battery.map_or("unknown".to_string(), |b| format!("{}%", b))
        );

        let stream = link
            .subscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
            .await?;

        *self.shared.device_name.lock().unwrap() = Some(name.clone());
        *self.shared.battery_level.lock().unwrap() = battery;
        *self.shared.link.lock().await = Some(link);
        self.set_state(HrmState::Subscribed);
        let _ = self.shared.events_tx.send(HrmEvent::Connected {
            device_name: name,
        });

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(data) = stream.next().await {
                match parse_hr_measurement(&data) {
                    Some(bpm) => {
                        debug!("heart rate: {} bpm", bpm);
                        let _ = shared.hr_tx.send(HeartRateSample {
                            time_ms: epoch_ms(),
                            bpm,
                        });
                    }
                    None => warn!("unparseable heart rate measurement: {:02x?}", data),
                }
            }
            // Transport drop: surfaced as state + event, never an error.
            info!("heart rate notification stream ended");
            *shared.state.lock().unwrap() = HrmState::Disconnected;
            shared.device_name.lock().unwrap().take();
            shared.battery_level.lock().unwrap().take();
            if let Some(link) = shared.link.lock().await.take() {
                let _ = link.disconnect().await;
            }
            let _ = shared.events_tx.send(HrmEvent::Disconnected);
        });
        *self.shared.sub_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Retry [`connect`](Self::connect) up to [`RECONNECT_ATTEMPTS`] times,
    /// each attempt bounded by [`CONNECT_TIMEOUT`]. Succeeds on the first
    /// successful attempt; gives up with the last error.
    pub async fn reconnect(&self, device_id: &str) -> Result<()> {
        let mut last_err = Error::BleConnectTimeout(CONNECT_TIMEOUT);
        for attempt in 1..=RECONNECT_ATTEMPTS {
            match tokio::time::timeout(CONNECT_TIMEOUT, self.connect(device_id)).await {
                Ok(Ok(())) => {
                    info!("reconnected to {} on attempt {}", device_id, attempt);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        "connect attempt {}/{} to {} failed: {}",
                        attempt, RECONNECT_ATTEMPTS, device_id, e
                    );
                    last_err = e;
                }
                Err(_) => {
                    warn!(
                        "connect attempt {}/{} to {} timed out",
                        attempt, RECONNECT_ATTEMPTS, device_id
                    );
                    last_err = Error::BleConnectTimeout(CONNECT_TIMEOUT);
                }
            }
        }
        warn!(
            "giving up on {} after {} attempts",
            device_id, RECONNECT_ATTEMPTS
        );
        Err(last_err)
    }

    /// Release the peripheral. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(h) = self.shared.sub_task.lock().unwrap().take() {
            h.abort();
        }
        if let Some(link) = self.shared.link.lock().await.take() {
            info!("disconnecting from heart rate monitor");
            let _ = link.disconnect().await;
        }
        self.shared.device_name.lock().unwrap().take();
        self.shared.battery_level.lock().unwrap().take();
        self.set_state(HrmState::Disconnected);
    }

    fn set_state(&self, state: HrmState) {
        *self.shared.state.lock().unwrap() = state;
    }

    fn guard_not_connected(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if matches!(state, HrmState::Connected | HrmState::Subscribed) {
            return Err(Error::IllegalState {
                operation,
                state: state.as_str(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hr_uint8() {
        // flags=0x00 (uint8 format), rate=80
        assert_eq!(parse_hr_measurement(&[0x00, 0x50]), Some(80));
    }

    #[test]
    fn parse_hr_uint16() {
        // flags=0x01 (uint16 format), rate=304 (0x0130 LE = [0x30, 0x01])
        assert_eq!(parse_hr_measurement(&[0x01, 0x30, 0x01]), Some(304));
    }

    #[test]
    fn parse_hr_high_flag_bits_do_not_change_the_rate() {
        // Same rate under every combination of the non-format flag bits.
        for high_bits in 0u8..0x80 {
            let flags8 = high_bits << 1;
            assert_eq!(
                parse_hr_measurement(&[flags8, 155, 0xAA, 0xBB]),
                Some(155),
                "flags {flags8:#04x}"
            );

            let flags16 = (high_bits << 1) | 0x01;
            assert_eq!(
                parse_hr_measurement(&[flags16, 0x00, 0x01, 0xAA]),
                Some(256),
                "flags {flags16:#04x}"
            );
        }
    }

    #[test]
    fn parse_hr_empty_and_truncated() {
        assert_eq!(parse_hr_measurement(&[]), None);
        assert_eq!(parse_hr_measurement(&[0x00]), None);
        assert_eq!(parse_hr_measurement(&[0x01, 0x48]), None);
    }

    #[test]
    fn parse_hr_extremes() {
        assert_eq!(parse_hr_measurement(&[0x00, 0]), Some(0));
        assert_eq!(parse_hr_measurement(&[0x00, 255]), Some(255));
        assert_eq!(parse_hr_measurement(&[0x01, 0xFF, 0xFF]), Some(65535));
    }

    #[test]
    fn state_names() {
        assert_eq!(HrmState::WaitingForAdapter.as_str(), "waiting_for_adapter");
        assert_eq!(HrmState::Subscribed.as_str(), "subscribed");
    }
}
