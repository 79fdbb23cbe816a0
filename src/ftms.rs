//! BLE GATT peripheral for the FTMS (Fitness Machine Service) profile.
//!
//! Advertises as "WaterRower" and exposes the standard FTMS service
//! (UUID 0x1826) so fitness apps treat the rower as a recognised indoor
//! trainer. The rower has no treadmill-style belt telemetry; it maps onto
//! the Indoor Bike Data characteristic with stroke rate as cadence and the
//! calculated rowing power as instantaneous power.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::ble::{
    AdapterState, GattCharacteristicSpec, GattServiceSpec, PeripheralAdapter, FTMS_FEATURE_UUID,
    FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
};
use crate::error::Result;
use crate::registers::Sample;

// Fitness Machine Feature word 1 bits (word 2, target settings, is zero:
// the rower accepts no remote control).
const FEATURE_CADENCE_SUPPORTED: u32 = 1 << 1;
const FEATURE_POWER_MEASUREMENT_SUPPORTED: u32 = 1 << 14;

// Indoor Bike Data flag bits for the fields this peripheral carries.
const FLAG_INSTANTANEOUS_CADENCE: u16 = 1 << 2;
const FLAG_INSTANTANEOUS_POWER: u16 = 1 << 6;

/// Encode the Fitness Machine Feature characteristic (0x2ACC):
/// two little-endian 32-bit flag words.
pub fn encode_feature() -> [u8; 8] {
    let machine_features = FEATURE_CADENCE_SUPPORTED | FEATURE_POWER_MEASUREMENT_SUPPORTED;
    let target_features = 0u32;
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&machine_features.to_le_bytes());
    buf[4..8].copy_from_slice(&target_features.to_le_bytes());
    buf
}

/// Encode the Indoor Bike Data characteristic (0x2AD2), 6 bytes LE:
/// flags, cadence (stroke rate in 0.5 rpm units, so value x 2), power
/// (signed watts).
pub fn encode_indoor_bike_data(stroke_rate: u16, power_w: i16) -> [u8; 6] {
    let flags = FLAG_INSTANTANEOUS_CADENCE | FLAG_INSTANTANEOUS_POWER;
    let cadence = stroke_rate.saturating_mul(2);
    let mut buf = [0u8; 6];
    buf[0..2].copy_from_slice(&flags.to_le_bytes());
    buf[2..4].copy_from_slice(&cadence.to_le_bytes());
    buf[4..6].copy_from_slice(&power_w.to_le_bytes());
    buf
}

#[derive(Debug, Clone, Copy, Default)]
struct BikeData {
    stroke_rate: u16,
    power_w: i16,
}

struct Shared {
    adapter: Arc<dyn PeripheralAdapter>,
    name: String,
    data: StdMutex<BikeData>,
    advertising: AtomicBool,
    registered: AtomicBool,
    last_payload: StdMutex<Option<[u8; 6]>>,
}

/// Handle to the FTMS peripheral. Cheap to clone.
#[derive(Clone)]
pub struct FtmsPeripheral {
    shared: Arc<Shared>,
}

impl FtmsPeripheral {
    pub fn new(adapter: Arc<dyn PeripheralAdapter>, name: impl Into<String>) -> Self {
        FtmsPeripheral {
            shared: Arc::new(Shared {
                adapter,
                name: name.into(),
                data: StdMutex::new(BikeData::default()),
                advertising: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                last_payload: StdMutex::new(None),
            }),
        }
    }

    /// Update the cached bike data and notify subscribed centrals. Fields
    /// passed as `None` keep their most recent value. Returns whether any
    /// central received the notification.
    pub async fn update(&self, power_w: Option<i16>, cadence: Option<u16>) -> Result<bool> {
        let payload = {
            let mut data = self.shared.data.lock().unwrap();
            if let Some(p) = power_w {
                data.power_w = p;
            }
            if let Some(c) = cadence {
                data.stroke_rate = c;
            }
            encode_indoor_bike_data(data.stroke_rate, data.power_w)
        };
        *self.shared.last_payload.lock().unwrap() = Some(payload);

        let delivered = self
            .shared
            .adapter
            .notify(INDOOR_BIKE_DATA_UUID, payload.to_vec())
            .await?;
        if !delivered {
            debug!("indoor bike data update with no subscriber, dropped");
        }
        Ok(delivered)
    }

    /// The most recently encoded Indoor Bike Data payload.
    pub fn last_payload(&self) -> Option<[u8; 6]> {
        *self.shared.last_payload.lock().unwrap()
    }

    pub fn is_advertising(&self) -> bool {
        self.shared.advertising.load(Ordering::SeqCst)
    }

    /// Follow adapter power state and the datapoint stream until either
    /// ends: advertise while powered, push a notification per relevant
    /// sample.
    pub async fn run(&self, mut datapoints: broadcast::Receiver<Sample>) -> Result<()> {
        let mut power_events = self.shared.adapter.power_events().await?;
        info!("FTMS peripheral running as {:?}", self.shared.name);

        loop {
            tokio::select! {
                event = power_events.next() => match event {
                    Some(AdapterState::PoweredOn) => {
                        if let Err(e) = self.start_advertising().await {
                            warn!("failed to start advertising: {}", e);
                        }
                    }
                    Some(AdapterState::PoweredOff) => {
                        if let Err(e) = self.stop_advertising().await {
                            warn!("failed to stop advertising: {}", e);
                        }
                    }
                    None => {
                        info!("adapter power event stream ended");
                        break;
                    }
                },
                sample = datapoints.recv() => match sample {
                    Ok(sample) => self.handle_sample(&sample).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("FTMS subscriber lagged, {} samples dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("datapoint stream closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    async fn handle_sample(&self, sample: &Sample) {
        let result = match sample.name {
            "stroke_rate" => {
                let cadence = sample.value.min(u16::MAX as u32) as u16;
                self.update(None, Some(cadence)).await
            }
            "kcal_watts" => {
                let power = sample.value.min(i16::MAX as u32) as i16;
                self.update(Some(power), None).await
            }
            _ => return,
        };
        if let Err(e) = result {
            warn!("indoor bike data notification failed: {}", e);
        }
    }

    /// Start advertising and register the GATT application. Idempotent
    /// across duplicate power events.
    pub async fn start_advertising(&self) -> Result<()> {
        if self.shared.advertising.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("advertising as {:?} with FTMS service", self.shared.name);
        if let Err(e) = self
            .shared
            .adapter
            .advertise(&self.shared.name, FTMS_SERVICE_UUID)
            .await
        {
            self.shared.advertising.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if !self.shared.registered.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.shared.adapter.register_service(service_spec()).await {
                self.shared.registered.store(false, Ordering::SeqCst);
                return Err(e);
            }
            info!("FTMS GATT service registered");
        }
        Ok(())
    }

    /// Stop advertising. Idempotent.
    pub async fn stop_advertising(&self) -> Result<()> {
        if !self.shared.advertising.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("advertising stopped");
        self.shared.adapter.stop_advertising().await
    }
}

fn service_spec() -> GattServiceSpec {
    GattServiceSpec {
        uuid: FTMS_SERVICE_UUID,
        characteristics: vec![
            GattCharacteristicSpec {
                uuid: FTMS_FEATURE_UUID,
                read_value: Some(encode_feature().to_vec()),
                notify: false,
            },
            GattCharacteristicSpec {
                uuid: INDOOR_BIKE_DATA_UUID,
                read_value: None,
                notify: true,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_advertises_cadence_and_power() {
        let feat = encode_feature();
        let machine = u32::from_le_bytes([feat[0], feat[1], feat[2], feat[3]]);
        let target = u32::from_le_bytes([feat[4], feat[5], feat[6], feat[7]]);
        assert_eq!(machine, 0x0000_4002);
        assert_eq!(target, 0);
    }

    #[test]
    fn indoor_bike_data_layout() {
        // stroke rate 24, power 180 -> flags 0x0044, cadence 48, power 180
        let data = encode_indoor_bike_data(24, 180);
        assert_eq!(data, [0x44, 0x00, 0x30, 0x00, 0xB4, 0x00]);
    }

    #[test]
    fn indoor_bike_data_zeroes() {
        let data = encode_indoor_bike_data(0, 0);
        assert_eq!(data, [0x44, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn indoor_bike_data_negative_power() {
        let data = encode_indoor_bike_data(0, -1);
        assert_eq!(&data[4..6], &[0xFF, 0xFF]);
    }

    #[test]
    fn indoor_bike_data_across_operating_range() {
        for stroke_rate in (0u16..=300).step_by(7) {
            for power in (0i16..=2000).step_by(41) {
                let data = encode_indoor_bike_data(stroke_rate, power);
                assert_eq!(u16::from_le_bytes([data[0], data[1]]), 0x0044);
                assert_eq!(
                    u16::from_le_bytes([data[2], data[3]]),
                    stroke_rate * 2,
                    "cadence for stroke rate {stroke_rate}"
                );
                assert_eq!(
                    i16::from_le_bytes([data[4], data[5]]),
                    power,
                    "power {power}"
                );
            }
        }
    }

    #[test]
    fn cadence_saturates_instead_of_wrapping() {
        let data = encode_indoor_bike_data(u16::MAX, 0);
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), u16::MAX);
    }
}
