//! Host-side driver for the Creative PC-80B portable ECG recorder over BLE.
//!
//! The recorder streams its ECG trace as CRC-protected frames over GATT
//! notifications. This crate reassembles those frames, decodes them into
//! typed events, keeps the link alive with the handshake, acknowledgment and
//! heartbeat commands the device expects, and hands timestamped millivolt
//! samples to a consumer through a bounded [`SampleSink`].
//!
//! # Timing
//!
//! The device samples at 150 Hz but sends no per-sample time. Samples are
//! stamped from the device clock when it reports one, otherwise from the
//! host clock at the first burst, advancing 1/150 s per sample.
//!
//! # Platforms
//!
//! The session logic is transport-agnostic ([`BleTransport`]). A BlueZ
//! transport is available with the `bluez` feature.

#[cfg(feature = "bluez")]
mod bluetooth;
mod errors;
pub mod events;
pub mod frame;
pub mod logging;
pub mod session;
pub mod sink;
pub mod synthetic;
pub mod transport;

#[cfg(feature = "bluez")]
pub use bluetooth::BluezTransport;
pub use errors::*;
pub use events::{DisplayMeta, Event};
pub use frame::{Command, Frame, FrameAssembler, TransmissionType};
pub use session::{DeviceSession, SessionConfig, SessionHandle, SessionState, SessionStats};
pub use sink::{Sample, SampleSink, Status};
pub use synthetic::{SyntheticHandle, SyntheticSource};
pub use transport::{Advertisement, BleTransport, TransportEvent};
