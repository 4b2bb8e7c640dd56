//! Typed events decoded from validated frames.
//!
//! Decoding never fails: an unknown event byte, or a payload too short for
//! its event type, degrades to [`Event::Unknown`] carrying the raw bytes.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::frame::{hex, TransmissionType};

// ============================================================================
// Constants
// ============================================================================

pub const EV_DEVICE_INFO: u8 = 0x11;
/// Believed to carry the device clock; the layout has not been confirmed
/// against captures.
pub const EV_TIME: u8 = 0x33;
pub const EV_HANDSHAKE: u8 = 0x55;
pub const EV_CONTINUOUS_DATA: u8 = 0xAA;
pub const EV_FAST_DATA: u8 = 0xDD;
pub const EV_HEARTBEAT: u8 = 0xFF;

/// ADC reading corresponding to 0 mV.
pub const ADC_BASELINE: u16 = 2048;
/// ADC counts per millivolt.
pub const ADC_COUNTS_PER_MV: f64 = 330.0;

/// Samples carried by one non-final continuous-data frame.
pub const CONTINUOUS_SAMPLES: usize = 25;
const CONTINUOUS_PAYLOAD: usize = 1 + CONTINUOUS_SAMPLES * 2 + 3;
const FAST_HEADER: usize = 6;

/// Convert one raw ADC reading to millivolts.
#[inline]
pub fn raw_to_millivolts(raw: u16) -> f64 {
    (f64::from(raw) - f64::from(ADC_BASELINE)) / ADC_COUNTS_PER_MV
}

/// Decode little-endian 16-bit ADC readings into millivolts.
///
/// A trailing odd byte is ignored.
pub fn decode_samples(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(2)
        .map(|pair| raw_to_millivolts(u16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

// ============================================================================
// Bitfield enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Channel {
    #[default]
    Detecting,
    Internal,
    External,
}

impl Channel {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Channel::Detecting),
            1 => Some(Channel::Internal),
            2 => Some(Channel::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MeasurementMode {
    #[default]
    Detecting,
    Fast,
    Continuous,
}

impl MeasurementMode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(MeasurementMode::Detecting),
            1 => Some(MeasurementMode::Fast),
            2 => Some(MeasurementMode::Continuous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MeasurementStage {
    #[default]
    Detecting,
    Preparing,
    Measuring,
    Analyzing,
    Result,
    Stop,
}

impl MeasurementStage {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(MeasurementStage::Detecting),
            1 => Some(MeasurementStage::Preparing),
            2 => Some(MeasurementStage::Measuring),
            3 => Some(MeasurementStage::Analyzing),
            4 => Some(MeasurementStage::Result),
            5 => Some(MeasurementStage::Stop),
            _ => None,
        }
    }

    /// Stages after which the device sends no more samples for this measurement.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MeasurementStage::Analyzing | MeasurementStage::Result | MeasurementStage::Stop
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceModel {
    Pc80a,
    Pc80b,
    Pc80bUw,
    Unknown(u8),
}

impl DeviceModel {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            10 => DeviceModel::Pc80a,
            11 => DeviceModel::Pc80b,
            128 => DeviceModel::Pc80bUw,
            other => DeviceModel::Unknown(other),
        }
    }
}

impl std::fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceModel::Pc80a => f.write_str("PC-80A"),
            DeviceModel::Pc80b => f.write_str("PC-80B"),
            DeviceModel::Pc80bUw => f.write_str("PC-80B(UW)"),
            DeviceModel::Unknown(n) => write!(f, "<unknown {n}>"),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub software_version: String,
    pub hardware_version: u8,
    pub algorithm_version: u8,
}

/// Device clock. `zone` is passed through undecoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Time {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
    pub zone: u8,
}

impl Time {
    /// Calendar time, `None` when the device sent an impossible date.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?;
        date.and_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
    }
}

/// End of the device's preparation phase; it waits for the mode-selection
/// command before streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeReady {
    pub model: DeviceModel,
    pub filter_mode: u8,
    pub transmission_type: TransmissionType,
    /// Hex string of the serial number bytes.
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuousData {
    pub sequence_no: u8,
    pub is_final: bool,
    pub heart_rate: u8,
    pub lead_off: bool,
    pub gain: u8,
    /// Thousandths.
    pub volume: u16,
    /// Millivolts.
    pub samples: Vec<f64>,
}

impl ContinuousData {
    /// The device stalls unless every 64th chunk and the final one are acknowledged.
    pub fn requires_ack(&self) -> bool {
        requires_ack(self.sequence_no, self.is_final)
    }
}

/// Acknowledgment cadence of the continuous transmission mode.
pub fn requires_ack(sequence_no: u8, is_final: bool) -> bool {
    is_final || sequence_no % 64 == 0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FastData {
    pub sequence_no: u16,
    pub gain: u8,
    pub channel: Channel,
    pub measurement_mode: MeasurementMode,
    pub measurement_stage: MeasurementStage,
    pub heart_rate: u8,
    pub lead_off: bool,
    pub data_type: u8,
    /// Millivolts, empty once the stage is terminal.
    pub samples: Vec<f64>,
}

impl FastData {
    pub fn is_final(&self) -> bool {
        self.measurement_stage.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    DeviceInfo(DeviceInfo),
    Time(Time),
    HandshakeReady(HandshakeReady),
    ContinuousData(ContinuousData),
    FastData(FastData),
    Heartbeat { battery_level: u8 },
    Unknown { event_byte: u8, raw_payload: Vec<u8> },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::DeviceInfo(_) => "DeviceInfo",
            Event::Time(_) => "Time",
            Event::HandshakeReady(_) => "HandshakeReady",
            Event::ContinuousData(_) => "ContinuousData",
            Event::FastData(_) => "FastData",
            Event::Heartbeat { .. } => "Heartbeat",
            Event::Unknown { .. } => "Unknown",
        }
    }

    /// Decoded samples carried by a data event.
    pub fn samples(&self) -> &[f64] {
        match self {
            Event::ContinuousData(d) => &d.samples,
            Event::FastData(d) => &d.samples,
            _ => &[],
        }
    }

    /// `Some(is_final)` for data events, `None` otherwise.
    pub fn data_final(&self) -> Option<bool> {
        match self {
            Event::ContinuousData(d) => Some(d.is_final),
            Event::FastData(d) => Some(d.is_final()),
            _ => None,
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

type Decoder = fn(&[u8]) -> Option<Event>;

const DECODERS: [(u8, Decoder); 6] = [
    (EV_DEVICE_INFO, decode_device_info),
    (EV_TIME, decode_time),
    (EV_HANDSHAKE, decode_handshake),
    (EV_CONTINUOUS_DATA, decode_continuous),
    (EV_FAST_DATA, decode_fast),
    (EV_HEARTBEAT, decode_heartbeat),
];

/// Map an event byte and its payload to a typed event.
pub fn decode(event_byte: u8, payload: &[u8]) -> Event {
    DECODERS
        .iter()
        .find(|(code, _)| *code == event_byte)
        .and_then(|(_, decoder)| decoder(payload))
        .unwrap_or_else(|| Event::Unknown {
            event_byte,
            raw_payload: payload.to_vec(),
        })
}

fn decode_device_info(data: &[u8]) -> Option<Event> {
    if data.len() < 2 {
        return None;
    }
    let dotted = |bytes: &[u8]| {
        bytes
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(".")
    };
    let software_version = match data.len() {
        6 => dotted(&data[..4]),
        8 => {
            let tail: String = data[3..].iter().map(|b| b.to_string()).collect();
            format!("{}.{}", dotted(&data[..3]), tail)
        }
        _ => data[0].to_string(),
    };
    Some(Event::DeviceInfo(DeviceInfo {
        software_version,
        hardware_version: data[data.len() - 2],
        algorithm_version: data[data.len() - 1],
    }))
}

fn decode_time(data: &[u8]) -> Option<Event> {
    if data.len() < 8 {
        return None;
    }
    Some(Event::Time(Time {
        second: data[0],
        minute: data[1],
        hour: data[2],
        day: data[3],
        month: data[4],
        year: u16::from_le_bytes([data[5], data[6]]),
        zone: data[7],
    }))
}

fn decode_handshake(data: &[u8]) -> Option<Event> {
    if data.len() < 2 {
        return None;
    }
    let modes = data[1];
    let serial = hex(&data[2..]);
    Some(Event::HandshakeReady(HandshakeReady {
        model: DeviceModel::from_byte(data[0]),
        filter_mode: (modes & 0x80) >> 7,
        transmission_type: TransmissionType::from_bit(modes),
        serial,
    }))
}

fn decode_continuous(data: &[u8]) -> Option<Event> {
    let sequence_no = *data.first()?;
    if data.len() == 1 {
        return Some(Event::ContinuousData(ContinuousData {
            sequence_no,
            is_final: true,
            heart_rate: 0,
            lead_off: false,
            gain: 0,
            volume: 0,
            samples: Vec::new(),
        }));
    }
    if data.len() != CONTINUOUS_PAYLOAD {
        return None;
    }

    let samples_end = 1 + CONTINUOUS_SAMPLES * 2;
    let heart_rate = data[samples_end];
    let volume_low = data[samples_end + 1];
    // lead-off (bit 7), gain (bits 6:4), volume high nibble (bits 3:0)
    let lgv = data[samples_end + 2];
    Some(Event::ContinuousData(ContinuousData {
        sequence_no,
        is_final: false,
        heart_rate,
        lead_off: lgv & 0x80 != 0,
        gain: (lgv & 0x70) >> 4,
        volume: (u16::from(lgv & 0x0F) << 8) | u16::from(volume_low),
        samples: decode_samples(&data[1..samples_end]),
    }))
}

fn decode_fast(data: &[u8]) -> Option<Event> {
    if data.len() < FAST_HEADER {
        return None;
    }
    let sequence_no = u16::from_le_bytes([data[0], data[1]]);
    let gain = (data[2] & 0x70) >> 4;
    // channel (bits 7:6), mode (bits 5:4), stage (bits 3:0)
    let cmsh = data[3];
    let channel = Channel::from_bits((cmsh & 0xC0) >> 6)?;
    let measurement_mode = MeasurementMode::from_bits((cmsh & 0x30) >> 4)?;
    let measurement_stage = MeasurementStage::from_bits(cmsh & 0x0F)?;
    let heart_rate = data[4];
    let ldt = data[5];

    let samples = if measurement_stage.is_terminal() {
        Vec::new()
    } else {
        decode_samples(&data[FAST_HEADER..])
    };

    Some(Event::FastData(FastData {
        sequence_no,
        gain,
        channel,
        measurement_mode,
        measurement_stage,
        heart_rate,
        lead_off: ldt & 0x80 != 0,
        data_type: ldt & 0x07,
        samples,
    }))
}

fn decode_heartbeat(data: &[u8]) -> Option<Event> {
    Some(Event::Heartbeat {
        battery_level: data.first().copied().unwrap_or(0),
    })
}

// ============================================================================
// Display metadata
// ============================================================================

/// Latest device readings a waveform renderer shows next to the trace.
///
/// Each event variant updates exactly the fields listed in [`DisplayMeta::apply`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayMeta {
    pub device_time: Option<NaiveDateTime>,
    pub battery: u8,
    pub heart_rate: u8,
    pub lead_off: bool,
    pub gain: u8,
    pub volume: u16,
    pub channel: Channel,
    pub measurement_mode: MeasurementMode,
    pub measurement_stage: MeasurementStage,
    pub data_type: u8,
}

impl Default for DisplayMeta {
    fn default() -> Self {
        Self {
            device_time: None,
            battery: 0,
            heart_rate: 0,
            // No electrode contact until the device says otherwise.
            lead_off: true,
            gain: 0,
            volume: 0,
            channel: Channel::default(),
            measurement_mode: MeasurementMode::default(),
            measurement_stage: MeasurementStage::default(),
            data_type: 0,
        }
    }
}

impl DisplayMeta {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ContinuousData(d) if !d.is_final => {
                self.heart_rate = d.heart_rate;
                self.lead_off = d.lead_off;
                self.gain = d.gain;
                self.volume = d.volume;
            }
            Event::FastData(d) => {
                self.heart_rate = d.heart_rate;
                self.lead_off = d.lead_off;
                self.gain = d.gain;
                self.channel = d.channel;
                self.measurement_mode = d.measurement_mode;
                self.measurement_stage = d.measurement_stage;
                self.data_type = d.data_type;
            }
            Event::Heartbeat { battery_level } => self.battery = *battery_level,
            Event::Time(t) => self.device_time = t.as_datetime(),
            Event::ContinuousData(_)
            | Event::DeviceInfo(_)
            | Event::HandshakeReady(_)
            | Event::Unknown { .. } => {}
        }
    }
}
