use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// A completed frame that failed integrity checks. The frame is dropped, the
/// session keeps streaming, so this never surfaces as a [`DriverError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad start byte: {0:#04x}")]
    BadStart(u8),
    #[error("length field {declared} does not match frame of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("CRC mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("no bluetooth adapter available: {0}")]
    Adapter(String),
    #[error("advertisement scan ended without finding the device")]
    ScanEnded,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("GATT operation failed: {0}")]
    Gatt(String),
    #[error("service not found: {0}")]
    MissingService(Uuid),
    #[error("characteristic not found: {0}")]
    MissingCharacteristic(Uuid),
    #[error("connection not established")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DriverError {
    /// Connect timeouts are retried from a fresh scan instead of being
    /// treated as a link failure.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, DriverError::Bluetooth(BluetoothError::ConnectTimeout(_)))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
