//! Device session: the scan → connect → handshake → stream → retry loop.
//!
//! A session runs as one spawned task that owns its transport, its frame
//! buffer and its state. Nothing it encounters is fatal: framing errors drop
//! one frame, connect timeouts and disconnects restart from scanning. Only
//! [`SessionHandle::stop`] ends it.
//!
//! # Example
//! ```ignore
//! let sink = Arc::new(SampleSink::default());
//! let transport = BluezTransport::new().await?;
//! let handle = DeviceSession::new(transport, Arc::clone(&sink), SessionConfig::default()).start();
//!
//! let slice = sink.pull(5);
//! println!("{:?} {:?}", sink.get_status(), slice);
//!
//! handle.stop().await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::errors::{DriverError, Result};
use crate::events::{decode, Event};
use crate::frame::{hex, validate, Command, FrameAssembler};
use crate::sink::{EventFeed, SampleSink};
use crate::transport::{
    short_uuid, Advertisement, BleTransport, TransportEvent, CONTROL_CHARACTERISTIC, DEVICE_NAME,
    NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC,
};

// ============================================================================
// Constants
// ============================================================================

/// Wait between discovering the device and connecting. Connecting right after
/// the advertisement fails on some stacks.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Send a keep-alive when nothing else was written for this long.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const HEARTBEAT_CHECK: Duration = Duration::from_secs(1);

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the disconnect issued while stopping.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_HISTORY: usize = 64;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Scanning,
    Found,
    Connecting,
    Connected,
    Streaming,
    Disconnected,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Scanning => "scanning",
            SessionState::Found => "found",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
            SessionState::Disconnected => "disconnected",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Session tuning. Defaults match the recorder's observed behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Advertised name to connect to.
    pub device_name: String,
    pub settle_delay: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Period of the idle-link check.
    pub heartbeat_check: Duration,
    /// Pause before scanning again after a failure.
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.into(),
            settle_delay: SETTLE_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_check: HEARTBEAT_CHECK,
            retry_delay: RETRY_DELAY,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `PC80B_DEVICE_NAME`, `PC80B_SETTLE_MS` and
    /// `PC80B_CONNECT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup("PC80B_DEVICE_NAME") {
            config.device_name = name;
        }
        if let Some(delay) = env_millis(&lookup, "PC80B_SETTLE_MS")? {
            config.settle_delay = delay;
        }
        if let Some(timeout) = env_millis(&lookup, "PC80B_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = timeout;
        }
        Ok(config)
    }
}

fn env_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| DriverError::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

/// Running counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_decoded: u64,
    pub framing_errors: u64,
    pub acks_sent: u64,
    pub heartbeats_sent: u64,
    pub reconnects: u64,
}

// ============================================================================
// DeviceSession
// ============================================================================

/// A not-yet-started session. [`start`](Self::start) spawns it on the current
/// tokio runtime.
pub struct DeviceSession<T> {
    transport: T,
    sink: Arc<SampleSink>,
    config: SessionConfig,
    transitions: broadcast::Sender<SessionState>,
}

impl<T: BleTransport + 'static> DeviceSession<T> {
    pub fn new(transport: T, sink: Arc<SampleSink>, config: SessionConfig) -> Self {
        let (transitions, _) = broadcast::channel(STATE_HISTORY);
        Self {
            transport,
            sink,
            config,
            transitions,
        }
    }

    /// Every state transition from the moment the session starts.
    pub fn subscribe_states(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    pub fn start(self) -> SessionHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Scanning);
        let stats = Arc::new(Mutex::new(SessionStats::default()));

        let mut config = self.config;
        config.heartbeat_check = config.heartbeat_check.max(Duration::from_millis(1));

        let runner = Runner {
            transport: self.transport,
            config,
            feed: EventFeed::new(Arc::clone(&self.sink)),
            assembler: FrameAssembler::new(),
            state_tx,
            transitions: self.transitions.clone(),
            stats: Arc::clone(&stats),
            stop: stop_rx,
            last_write: Instant::now(),
        };
        let task = tokio::spawn(runner.run());

        SessionHandle {
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
            state_rx,
            transitions: self.transitions,
            stats,
            sink: self.sink,
        }
    }
}

/// Control side of a running session.
///
/// Dropping the handle without calling [`stop`](Self::stop) also stops the
/// session, but without waiting for it.
pub struct SessionHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    stats: Arc<Mutex<SessionStats>>,
    sink: Arc<SampleSink>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Transitions from now on.
    pub fn subscribe_states(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn sink(&self) -> &Arc<SampleSink> {
        &self.sink
    }

    /// Request the session to end and wait until its task has fully unwound,
    /// including the disconnect when it was connected. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!("session task ended abnormally: {e}");
            }
        }
    }
}

// ============================================================================
// Session task
// ============================================================================

/// How one scan/connect/stream cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Stopped,
    Disconnected,
    Retry,
}

enum Wake {
    Tick,
    Link(Option<TransportEvent>),
}

/// Run `fut` unless a stop is requested first. `None` means stop.
///
/// A dropped stop sender counts as a stop request.
pub(crate) async fn cancellable<F: Future>(
    stop: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *stop.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => None,
        out = fut => Some(out),
    }
}

struct Runner<T> {
    transport: T,
    config: SessionConfig,
    feed: EventFeed,
    assembler: FrameAssembler,
    state_tx: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    stats: Arc<Mutex<SessionStats>>,
    stop: watch::Receiver<bool>,
    last_write: Instant,
}

impl<T: BleTransport> Runner<T> {
    async fn run(mut self) {
        loop {
            match self.cycle().await {
                Flow::Stopped => break,
                Flow::Disconnected => {
                    self.enter(SessionState::Disconnected);
                    self.report(false, "Disconnected");
                    self.transport.clear_disconnect();
                    self.bump(|s| s.reconnects += 1);
                }
                Flow::Retry => {
                    let delay = tokio::time::sleep(self.config.retry_delay);
                    if cancellable(&mut self.stop, delay).await.is_none() {
                        break;
                    }
                }
            }
        }

        self.enter(SessionState::Stopped);
        self.feed.sink().clear();
        self.report(false, "Acquisition stopped");
    }

    async fn cycle(&mut self) -> Flow {
        let device = match self.scan().await {
            Ok(Some(device)) => device,
            Ok(None) => return Flow::Stopped,
            Err(e) => {
                warn!("scan failed: {e}");
                return Flow::Retry;
            }
        };

        self.enter(SessionState::Found);
        self.report(false, format!("Found {device}"));
        debug!("waiting {:?} before connecting", self.config.settle_delay);
        let settle = tokio::time::sleep(self.config.settle_delay);
        if cancellable(&mut self.stop, settle).await.is_none() {
            return Flow::Stopped;
        }

        self.enter(SessionState::Connecting);
        self.report(false, format!("Connecting {device}"));
        let connect = self.transport.connect(&device, self.config.connect_timeout);
        match cancellable(&mut self.stop, connect).await {
            None => return Flow::Stopped,
            Some(Err(e)) if e.is_connect_timeout() => {
                warn!("timeout connecting to {device}, retrying: {e}");
                return Flow::Retry;
            }
            Some(Err(e)) => {
                warn!("connecting to {device} failed, retrying: {e}");
                return Flow::Retry;
            }
            Some(Ok(())) => {}
        }

        self.enter(SessionState::Connected);
        match self.connected(&device).await {
            Ok(Flow::Stopped) => {
                info!("stop requested while connected to {device}");
                self.disconnect().await;
                Flow::Stopped
            }
            Ok(flow) => flow,
            Err(e) => {
                warn!("link to {device} failed: {e}");
                self.disconnect().await;
                Flow::Retry
            }
        }
    }

    /// Watch advertisements until the configured name shows up.
    async fn scan(&mut self) -> Result<Option<Advertisement>> {
        self.enter(SessionState::Scanning);
        self.report(false, "Scanning");

        let Some(started) = cancellable(&mut self.stop, self.transport.start_scan()).await else {
            return Ok(None);
        };
        started?;
        info!("waiting for {} to appear", self.config.device_name);

        let found = loop {
            let next = cancellable(&mut self.stop, self.transport.next_advertisement()).await;
            match next {
                None => break None,
                Some(Err(e)) => {
                    self.stop_scan().await;
                    return Err(e);
                }
                Some(Ok(None)) => {
                    self.stop_scan().await;
                    return Err(crate::errors::BluetoothError::ScanEnded.into());
                }
                Some(Ok(Some(adv))) => {
                    if adv.name.as_deref() == Some(self.config.device_name.as_str()) {
                        info!("found {adv}");
                        break Some(adv);
                    }
                    debug!("ignoring {adv}");
                }
            }
        };
        self.stop_scan().await;
        Ok(found)
    }

    async fn stop_scan(&mut self) {
        if let Err(e) = self.transport.stop_scan().await {
            debug!("stopping scan: {e}");
        }
    }

    /// GATT setup followed by streaming. Returns `Flow::Stopped` when a stop
    /// arrived, leaving the disconnect to the caller.
    async fn connected(&mut self, device: &Advertisement) -> Result<Flow> {
        let Some(info) = cancellable(&mut self.stop, self.transport.read_device_info()).await else {
            return Ok(Flow::Stopped);
        };
        let details = describe_device_info(&info?);

        let control = self.transport.read(CONTROL_CHARACTERISTIC);
        let Some(control) = cancellable(&mut self.stop, control).await else {
            return Ok(Flow::Stopped);
        };
        let control = control?;
        info!("connected to {device}; {details}; control value {}", hex(&control));

        self.assembler.clear();
        self.feed.reset();

        let subscribe = self.transport.subscribe(NOTIFY_CHARACTERISTIC);
        let Some(subscribed) = cancellable(&mut self.stop, subscribe).await else {
            return Ok(Flow::Stopped);
        };
        subscribed?;

        // Disconnects reported during setup are spurious: the calls above
        // would have failed on a dead link.
        self.transport.clear_disconnect();

        self.report(false, format!("Connected {device} {details}"));
        self.enter(SessionState::Streaming);
        self.stream().await
    }

    async fn stream(&mut self) -> Result<Flow> {
        self.last_write = Instant::now();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_check);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let transport = &mut self.transport;
            let wake = async {
                tokio::select! {
                    biased;
                    event = transport.next_event() => Wake::Link(event),
                    _ = heartbeat.tick() => Wake::Tick,
                }
            };
            let Some(wake) = cancellable(&mut self.stop, wake).await else {
                return Ok(Flow::Stopped);
            };

            let proceed = match wake {
                Wake::Tick => self.heartbeat_if_idle().await?,
                Wake::Link(Some(TransportEvent::Notification(chunk))) => {
                    self.on_notification(&chunk).await?
                }
                Wake::Link(Some(TransportEvent::Disconnected)) | Wake::Link(None) => {
                    info!("device disconnected");
                    return Ok(Flow::Disconnected);
                }
            };
            if !proceed {
                return Ok(Flow::Stopped);
            }
        }
    }

    /// Feed one notification through framing, validation and decoding, and
    /// react to each resulting event before looking at the next.
    async fn on_notification(&mut self, chunk: &[u8]) -> Result<bool> {
        self.assembler.extend(chunk);
        while let Some(frame) = self.assembler.next_frame() {
            let event = match validate(&frame) {
                Ok((event_byte, payload)) => decode(event_byte, payload),
                Err(e) => {
                    self.bump(|s| s.framing_errors += 1);
                    warn!("dropping frame: {e}");
                    debug!("dropped frame bytes: {}", hex(frame.as_bytes()));
                    continue;
                }
            };
            self.bump(|s| s.frames_decoded += 1);
            if !self.dispatch(event).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn dispatch(&mut self, event: Event) -> Result<bool> {
        self.feed.forward(&event);

        match &event {
            Event::HandshakeReady(h) => {
                info!(
                    "{} ready (serial {}, filter mode {}), selecting {:?} transmission",
                    h.model, h.serial, h.filter_mode, h.transmission_type
                );
                self.send(Command::SelectTransmission(h.transmission_type))
                    .await
            }
            Event::ContinuousData(d) if d.requires_ack() => {
                let sent = self.send(Command::Acknowledge(d.sequence_no)).await?;
                if sent {
                    self.bump(|s| s.acks_sent += 1);
                }
                Ok(sent)
            }
            Event::DeviceInfo(info) => {
                info!(
                    "device firmware {}, hardware {}, algorithm {}",
                    info.software_version, info.hardware_version, info.algorithm_version
                );
                Ok(true)
            }
            Event::Heartbeat { battery_level } => {
                debug!("battery level {battery_level}");
                Ok(true)
            }
            Event::Unknown {
                event_byte,
                raw_payload,
            } => {
                warn!("unhandled event {event_byte:#04x}: {}", hex(raw_payload));
                Ok(true)
            }
            Event::Time(_) | Event::ContinuousData(_) | Event::FastData(_) => Ok(true),
        }
    }

    async fn heartbeat_if_idle(&mut self) -> Result<bool> {
        if self.last_write.elapsed() < self.config.heartbeat_interval {
            return Ok(true);
        }
        let sent = self.send(Command::Heartbeat).await?;
        if sent {
            self.bump(|s| s.heartbeats_sent += 1);
        }
        Ok(sent)
    }

    /// Write a command and wait for the write to complete. `Ok(false)` when a
    /// stop interrupted it.
    async fn send(&mut self, command: Command) -> Result<bool> {
        let bytes = command.encode();
        debug!("sending {}: {}", command.name(), hex(&bytes));
        let write = self.transport.write(WRITE_CHARACTERISTIC, &bytes);
        let Some(written) = cancellable(&mut self.stop, write).await else {
            return Ok(false);
        };
        written?;
        self.last_write = Instant::now();
        Ok(true)
    }

    async fn disconnect(&mut self) {
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.transport.disconnect()).await {
            Ok(Ok(())) => info!("disconnected"),
            Ok(Err(e)) => warn!("disconnect failed: {e}"),
            Err(_) => warn!("disconnect timed out after {DISCONNECT_TIMEOUT:?}"),
        }
    }

    fn enter(&mut self, state: SessionState) {
        info!("session state: {state}");
        self.state_tx.send_replace(state);
        // No subscribers is fine.
        let _ = self.transitions.send(state);
    }

    fn report(&self, active: bool, text: impl Into<String>) {
        self.feed.sink().report_status(active, text);
    }

    fn bump(&self, update: impl FnOnce(&mut SessionStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }
}

/// `"2a29: ACME, 2a24: PC-80B"` from the Device Information characteristics.
fn describe_device_info(info: &[(Uuid, Vec<u8>)]) -> String {
    info.iter()
        .map(|(uuid, value)| {
            let text = String::from_utf8_lossy(value);
            format!("{}: {}", short_uuid(uuid), text.trim_end_matches('\0').trim())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
