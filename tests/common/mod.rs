//! Scripted in-memory transport for driving a session without a radio.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use pc80b_rs::events::{EV_CONTINUOUS_DATA, EV_FAST_DATA, EV_HANDSHAKE};
use pc80b_rs::frame::{crc8, START_BYTE};
use pc80b_rs::transport::{Advertisement, BleTransport, TransportEvent, DEVICE_NAME};
use pc80b_rs::{BluetoothError, Result, SessionConfig, SessionState};

/// Every transport operation the session performed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    ReadDeviceInfo,
    Read(Uuid),
    Write(Vec<u8>),
    Subscribe(Uuid),
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn all(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.all()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.all().iter().filter(|call| *call == wanted).count()
    }
}

/// Outcome of one connect attempt.
pub enum Link {
    Timeout,
    Up {
        /// Events with their delivery time, counted from the connect.
        events: Vec<(Duration, TransportEvent)>,
        /// Report a disconnect while the link is still being set up.
        spurious_disconnect: bool,
    },
}

impl Link {
    /// A link delivering `events` right away.
    pub fn up(events: Vec<TransportEvent>) -> Self {
        Self::timed(events.into_iter().map(|e| (Duration::ZERO, e)).collect())
    }

    pub fn timed(events: Vec<(Duration, TransportEvent)>) -> Self {
        Link::Up {
            events,
            spurious_disconnect: false,
        }
    }

    pub fn with_setup_disconnect(self) -> Self {
        match self {
            Link::Up { events, .. } => Link::Up {
                events,
                spurious_disconnect: true,
            },
            timeout => timeout,
        }
    }
}

/// Plays back advertisements and per-connection event scripts. Once a script
/// runs dry the corresponding call pends forever, like a quiet radio.
#[derive(Default)]
pub struct ScriptedTransport {
    advertisements: VecDeque<Advertisement>,
    links: VecDeque<Link>,
    pending: VecDeque<(Duration, TransportEvent)>,
    connected_at: Option<Instant>,
    setup_disconnect: bool,
    calls: CallLog,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advertise(mut self, adv: Advertisement) -> Self {
        self.advertisements.push_back(adv);
        self
    }

    pub fn link(mut self, link: Link) -> Self {
        self.links.push_back(link);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

impl BleTransport for ScriptedTransport {
    fn start_scan(&mut self) -> BoxFuture<'_, Result<()>> {
        self.calls.push(Call::StartScan);
        future::ready(Ok(())).boxed()
    }

    fn next_advertisement(&mut self) -> BoxFuture<'_, Result<Option<Advertisement>>> {
        match self.advertisements.pop_front() {
            Some(adv) => future::ready(Ok(Some(adv))).boxed(),
            None => future::pending().boxed(),
        }
    }

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<()>> {
        self.calls.push(Call::StopScan);
        future::ready(Ok(())).boxed()
    }

    fn connect<'a>(
        &'a mut self,
        device: &'a Advertisement,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        self.calls.push(Call::Connect(device.address.clone()));
        let result = match self.links.pop_front() {
            Some(Link::Timeout) => Err(BluetoothError::ConnectTimeout(timeout).into()),
            Some(Link::Up {
                events,
                spurious_disconnect,
            }) => {
                self.pending = events.into();
                self.connected_at = Some(Instant::now());
                self.setup_disconnect = spurious_disconnect;
                Ok(())
            }
            None => Err(BluetoothError::Connection("nothing scripted".into()).into()),
        };
        future::ready(result).boxed()
    }

    fn read_device_info(&mut self) -> BoxFuture<'_, Result<Vec<(Uuid, Vec<u8>)>>> {
        self.calls.push(Call::ReadDeviceInfo);
        let model = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
        future::ready(Ok(vec![(model, b"PC-80B".to_vec())])).boxed()
    }

    fn read(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<Vec<u8>>> {
        self.calls.push(Call::Read(characteristic));
        future::ready(Ok(vec![0x00])).boxed()
    }

    fn write<'a>(&'a mut self, _characteristic: Uuid, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.calls.push(Call::Write(data.to_vec()));
        future::ready(Ok(())).boxed()
    }

    fn subscribe(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<()>> {
        self.calls.push(Call::Subscribe(characteristic));
        future::ready(Ok(())).boxed()
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>> {
        if self.setup_disconnect {
            self.setup_disconnect = false;
            return future::ready(Some(TransportEvent::Disconnected)).boxed();
        }
        let (Some(start), Some((offset, _))) = (self.connected_at, self.pending.front()) else {
            return future::pending().boxed();
        };
        let due = start + *offset;
        // Pop only once due, so a caller dropping this future loses nothing.
        async move {
            tokio::time::sleep_until(due).await;
            self.pending.pop_front().map(|(_, event)| event)
        }
        .boxed()
    }

    fn clear_disconnect(&mut self) {
        self.setup_disconnect = false;
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        self.calls.push(Call::Disconnect);
        self.pending.clear();
        future::ready(Ok(())).boxed()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn recorder() -> Advertisement {
    Advertisement {
        name: Some(DEVICE_NAME.into()),
        address: "C0:11:22:33:44:55".into(),
        rssi: Some(-58),
    }
}

pub fn stranger() -> Advertisement {
    Advertisement {
        name: Some("Heart Rate Strap".into()),
        address: "D4:00:00:00:00:01".into(),
        rssi: Some(-80),
    }
}

/// Short delays, no heartbeat in the way.
pub fn quick_config() -> SessionConfig {
    SessionConfig {
        settle_delay: Duration::ZERO,
        retry_delay: Duration::from_millis(1),
        heartbeat_interval: Duration::from_secs(3600),
        ..SessionConfig::default()
    }
}

pub fn frame(event: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![START_BYTE, event, payload.len() as u8];
    bytes.extend_from_slice(payload);
    bytes.push(crc8(&bytes));
    bytes
}

/// PC-80B handshake requesting continuous transmission.
pub fn handshake() -> Vec<u8> {
    frame(EV_HANDSHAKE, &[11, 0x01, 0xDE, 0xAD, 0x01])
}

/// A 25-sample continuous chunk at 1 mV.
pub fn continuous(seq: u8) -> Vec<u8> {
    let mut payload = vec![seq];
    for _ in 0..25 {
        payload.extend_from_slice(&(2048u16 + 330).to_le_bytes());
    }
    payload.extend_from_slice(&[72, 0x00, 0x10]);
    frame(EV_CONTINUOUS_DATA, &payload)
}

/// End-of-measurement marker.
pub fn continuous_final(seq: u8) -> Vec<u8> {
    frame(EV_CONTINUOUS_DATA, &[seq])
}

/// PC-80B handshake requesting fast transmission.
pub fn fast_handshake() -> Vec<u8> {
    frame(EV_HANDSHAKE, &[11, 0x00, 0xDE, 0xAD, 0x01])
}

pub const STAGE_MEASURING: u8 = 2;
pub const STAGE_STOP: u8 = 5;

/// A fast-mode burst on the internal channel at heart rate 75, carrying
/// `samples` values of 1 mV.
pub fn fast(seq: u16, stage: u8, samples: usize) -> Vec<u8> {
    let [lo, hi] = seq.to_le_bytes();
    let cmsh = (1 << 6) | (1 << 4) | stage;
    let mut payload = vec![lo, hi, 0x20, cmsh, 75, 0x00];
    for _ in 0..samples {
        payload.extend_from_slice(&(2048u16 + 330).to_le_bytes());
    }
    frame(EV_FAST_DATA, &payload)
}

pub fn notify(bytes: Vec<u8>) -> TransportEvent {
    TransportEvent::Notification(bytes)
}

/// Split a byte stream into notification-sized pieces.
pub fn chunked(stream: &[u8], size: usize) -> Vec<TransportEvent> {
    stream.chunks(size).map(|c| notify(c.to_vec())).collect()
}

/// Collect transitions until `last` shows up, failing after a few seconds.
pub async fn states_until(
    rx: &mut broadcast::Receiver<SessionState>,
    last: SessionState,
) -> Vec<SessionState> {
    let mut seen = Vec::new();
    loop {
        let state = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("never reached {last}; saw {seen:?}"))
            .unwrap();
        seen.push(state);
        if state == last {
            return seen;
        }
    }
}

/// Poll `condition` until it holds, failing after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("condition not reached in time");
}
