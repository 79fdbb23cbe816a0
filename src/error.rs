//! Error types shared across the daemon.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No serial port with a WaterRower USB descriptor was found.
    #[error("no WaterRower S4 serial device found")]
    NoDeviceFound,

    /// The serial port (or a recording file standing in for it) failed.
    #[error("serial I/O error: {0}")]
    SerialIo(#[from] std::io::Error),

    /// A frame or recorded line could not be decoded. Logged and dropped by
    /// the driver, never fatal to the stream.
    #[error("malformed data: {0}")]
    ParseMalformed(String),

    /// The host Bluetooth adapter is missing or refuses to power on.
    #[error("bluetooth adapter unavailable: {0}")]
    BleAdapterUnavailable(String),

    /// A BLE connect attempt did not complete within its deadline.
    #[error("bluetooth connect timed out after {0:?}")]
    BleConnectTimeout(Duration),

    /// A required GATT service or characteristic is absent on the peer.
    #[error("bluetooth service not found: {0}")]
    BleServiceNotFound(String),

    /// Subscribing to notifications failed.
    #[error("bluetooth subscribe failed: {0}")]
    BleSubscribeFailed(String),

    /// Any other Bluetooth transport failure.
    #[error("bluetooth error: {0}")]
    Ble(String),

    /// A public operation was invoked from a state that does not allow it.
    #[error("{operation} not allowed in state {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },

    /// The owning resource was closed while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<tokio_serial::Error> for Error {
    fn from(e: tokio_serial::Error) -> Self {
        Error::SerialIo(std::io::Error::other(e.to_string()))
    }
}
