//! Capability interfaces over the host Bluetooth stack.
//!
//! The daemon's BLE components are written against these traits rather than
//! a concrete stack: [`CentralAdapter`] and [`PeripheralLink`] cover the
//! heart rate monitor side, [`PeripheralAdapter`] covers the FTMS GATT
//! server side. `bluez.rs` provides the BlueZ implementations; tests drive
//! the same components with in-memory mocks.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::Result;

/// Expand a 16-bit SIG-assigned number into a full 128-bit UUID
/// (base 0000XXXX-0000-1000-8000-00805f9b34fb).
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128)
}

// GATT services and characteristics used by the daemon.
pub const GAP_SERVICE_UUID: Uuid = ble_uuid(0x1800);
pub const DEVICE_NAME_UUID: Uuid = ble_uuid(0x2A00);
pub const BATTERY_SERVICE_UUID: Uuid = ble_uuid(0x180F);
pub const BATTERY_LEVEL_UUID: Uuid = ble_uuid(0x2A19);
pub const HEART_RATE_SERVICE_UUID: Uuid = ble_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A37);
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
pub const FTMS_FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);

/// A peripheral seen during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Stack-specific stable identifier (a BD address under BlueZ).
    pub id: String,
    pub name: Option<String>,
}

/// Host adapter power state, as relevant to advertising decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;
pub type PowerEventStream = Pin<Box<dyn Stream<Item = AdapterState> + Send>>;

/// Central-role capabilities: scan for peripherals and connect to them.
#[async_trait]
pub trait CentralAdapter: Send + Sync {
    /// Resolve once the adapter is powered on, powering it up if the stack
    /// allows. Fails with `BleAdapterUnavailable` when there is no adapter.
    async fn wait_powered_on(&self) -> Result<()>;

    /// Scan for peripherals advertising `service` for the given window and
    /// return everything seen, deduplicated by id.
    async fn scan(&self, service: Uuid, window: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Connect directly to a previously discovered (or remembered) device.
    async fn connect(&self, device_id: &str) -> Result<Box<dyn PeripheralLink>>;
}

/// An established connection to a remote peripheral.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    fn device_id(&self) -> &str;

    /// Read a characteristic value. `Ok(None)` when the service or
    /// characteristic is absent on the peer (absence is not an error for
    /// the optional reads this daemon performs).
    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>>;

    /// Subscribe to notifications. Fails with `BleServiceNotFound` when the
    /// characteristic is absent and `BleSubscribeFailed` when the peer
    /// refuses. The stream ends when the transport drops.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}

/// One characteristic of a locally served GATT service: either a static
/// read value, a notify source, or both.
#[derive(Debug, Clone)]
pub struct GattCharacteristicSpec {
    pub uuid: Uuid,
    pub read_value: Option<Vec<u8>>,
    pub notify: bool,
}

/// A locally served GATT service.
#[derive(Debug, Clone)]
pub struct GattServiceSpec {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristicSpec>,
}

/// Peripheral-role capabilities: advertise, serve a GATT application and
/// push notifications to subscribed centrals.
#[async_trait]
pub trait PeripheralAdapter: Send + Sync {
    /// Stream of adapter power transitions. Implementations emit the
    /// current state first so subscribers can act immediately.
    async fn power_events(&self) -> Result<PowerEventStream>;

    /// Start advertising `service` under `name`. Idempotent.
    async fn advertise(&self, name: &str, service: Uuid) -> Result<()>;

    /// Stop advertising. Idempotent.
    async fn stop_advertising(&self) -> Result<()>;

    /// Register the GATT application. Idempotent.
    async fn register_service(&self, service: GattServiceSpec) -> Result<()>;

    /// Push a notification to subscribed centrals. Returns `false` when no
    /// central is subscribed (the value is simply dropped).
    async fn notify(&self, characteristic: Uuid, payload: Vec<u8>) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ble_uuid_expands_sig_base() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FTMS_SERVICE_UUID.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            INDOOR_BIKE_DATA_UUID.to_string(),
            "00002ad2-0000-1000-8000-00805f9b34fb"
        );
    }
}
