//! The BLE boundary the session drives.
//!
//! Radio scanning and GATT primitives come from the platform stack; the
//! session only needs the handful of operations in [`BleTransport`]. The
//! BlueZ implementation lives in `bluetooth` behind the `bluez` feature.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{BluetoothError, Result};

/// Name the recorder advertises.
pub const DEVICE_NAME: &str = "PC80B-BLE";

/// Standard Device Information service; every characteristic is a string.
pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Vendor service carrying the framed protocol.
pub const VENDOR_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/// Host-to-device command characteristic.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// Control characteristic, read once after connecting.
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);

/// Device-to-host frame stream.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// 16-bit short form of a Bluetooth SIG base UUID, e.g. `2a29`.
pub fn short_uuid(uuid: &Uuid) -> String {
    let (d1, d2, d3, d4) = uuid.as_fields();
    if d2 == 0x0000 && d3 == 0x1000 && d4 == &[0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb] {
        format!("{:04x}", d1 & 0xFFFF)
    } else {
        uuid.to_string()
    }
}

/// Fail unless the GATT database lists the vendor service.
///
/// A device that advertises the right name without it is some other product.
pub fn require_vendor_service(services: &[Uuid]) -> Result<()> {
    if services.contains(&VENDOR_SERVICE) {
        Ok(())
    } else {
        Err(BluetoothError::MissingService(VENDOR_SERVICE).into())
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    /// Platform identifier: a MAC address on Linux.
    pub address: String,
    pub rssi: Option<i16>,
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.address
        )?;
        if let Some(rssi) = self.rssi {
            write!(f, " rssi {rssi}")?;
        }
        Ok(())
    }
}

/// Link events, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Value of one notification on the subscribed characteristic.
    Notification(Vec<u8>),
    /// The platform reports the link is gone.
    Disconnected,
}

/// Platform BLE operations used by the session.
///
/// Methods return boxed futures so the trait stays object safe and the
/// session task remains `Send`.
pub trait BleTransport: Send {
    fn start_scan(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Next advertisement, `None` once the scan can produce no more.
    fn next_advertisement(&mut self) -> BoxFuture<'_, Result<Option<Advertisement>>>;

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Connect, failing with `BluetoothError::ConnectTimeout` after `timeout`.
    fn connect<'a>(
        &'a mut self,
        device: &'a Advertisement,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    /// Every characteristic of the Device Information service with its value.
    fn read_device_info(&mut self) -> BoxFuture<'_, Result<Vec<(Uuid, Vec<u8>)>>>;

    fn read(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<Vec<u8>>>;

    /// Write with response; resolves once the device has accepted the value.
    fn write<'a>(&'a mut self, characteristic: Uuid, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Start delivering notifications of `characteristic` through [`next_event`](Self::next_event).
    fn subscribe(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<()>>;

    /// Next link event, `None` when the event source has closed.
    ///
    /// Must be cancel safe: the session races it against its heartbeat timer
    /// and drops the losing future.
    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>>;

    /// Forget disconnect events reported so far, keeping pending notifications.
    ///
    /// Some stacks report spurious disconnects while a connection is being
    /// set up; the session calls this once setup has succeeded.
    fn clear_disconnect(&mut self);

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Link events from forwarding tasks, merged in arrival order.
///
/// Platform transports hand [`sender`](Self::sender) clones to the tasks that
/// watch notifications and link state, and serve [`BleTransport::next_event`]
/// from [`next`](Self::next).
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::Sender<TransportEvent>,
    rx: mpsc::Receiver<TransportEvent>,
    /// Notifications set aside by `clear_disconnect`.
    stash: VecDeque<TransportEvent>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx,
            stash: VecDeque::new(),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<TransportEvent> {
        self.tx.clone()
    }

    /// Drop everything queued so far. Call once the tasks of the previous
    /// link are gone, so none of its events reach the next one. Returns how
    /// many events were discarded.
    pub fn reset(&mut self) -> usize {
        let mut dropped = self.stash.len();
        self.stash.clear();
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("discarded {dropped} events from the previous link");
        }
        dropped
    }

    /// See [`BleTransport::clear_disconnect`].
    pub fn clear_disconnect(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                TransportEvent::Disconnected => debug!("ignoring disconnect reported during setup"),
                notification => self.stash.push_back(notification),
            }
        }
        self.stash
            .retain(|event| !matches!(event, TransportEvent::Disconnected));
    }

    pub async fn next(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.stash.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }
}
