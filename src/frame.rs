//! Wire framing for the PC-80B notification stream.
//!
//! Every message, in both directions, has the layout
//!
//! ```text
//! [0xA5][event:1][len:1][payload:len][crc8:1]
//! ```
//!
//! The trailing byte is a CRC-8/MAXIM (poly 0x31 reflected, init 0, no final
//! XOR) over everything before it. BLE notifications do not respect frame
//! boundaries: one notification may carry a fragment, a whole frame, or
//! several frames back to back, so [`FrameAssembler`] buffers bytes until a
//! complete length-delimited frame is available.

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;

use crate::errors::FramingError;

/// Start-of-frame sentinel.
pub const START_BYTE: u8 = 0xA5;

/// Start, event, length and CRC bytes surrounding the payload.
pub const FRAME_OVERHEAD: usize = 4;

/// Offset of the payload length field.
const LENGTH_OFFSET: usize = 2;

/// Offset of the first payload byte.
const PAYLOAD_OFFSET: usize = 3;

/// Reflected form of the 0x31 polynomial.
const CRC8_MAXIM_POLY: u8 = 0x8C;

static CRC8_TABLE: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u8;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ CRC8_MAXIM_POLY
            } else {
                crc >> 1
            };
        }
        *slot = crc;
    }
    table
});

/// CRC-8/MAXIM over `data`.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| CRC8_TABLE[(crc ^ byte) as usize])
}

/// Lowercase hex without separators, for logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================================
// Frame
// ============================================================================

/// One complete frame as cut from the byte stream. Not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Event type byte, if the frame is long enough to carry one.
    pub fn event_byte(&self) -> Option<u8> {
        self.bytes.get(1).copied()
    }
}

/// Check the start sentinel, the length field and the trailing checksum.
///
/// Returns the event byte and the payload slice on success.
pub fn validate(frame: &Frame) -> Result<(u8, &[u8]), FramingError> {
    let bytes = frame.as_bytes();
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FramingError::TooShort(bytes.len()));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 1);
    let received = trailer[0];
    let computed = crc8(body);
    if computed != received {
        return Err(FramingError::Checksum { computed, received });
    }

    if bytes[0] != START_BYTE {
        return Err(FramingError::BadStart(bytes[0]));
    }

    let declared = bytes[LENGTH_OFFSET] as usize;
    if declared + FRAME_OVERHEAD != bytes.len() {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    Ok((bytes[1], &body[PAYLOAD_OFFSET..]))
}

// ============================================================================
// Frame assembly
// ============================================================================

/// Accumulates notification chunks and cuts them into complete frames.
///
/// Bytes are never dropped here; a frame is only released once
/// `length + 4` bytes are buffered, and anything beyond it stays buffered for
/// the next frame.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
    /// Size of the frame at the head of the buffer, 0 until its length byte arrives.
    needed: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and lazily yield every frame it completes, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.extend(chunk);
        Frames { assembler: self }
    }

    /// Append a chunk without extracting frames.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cut the next complete frame off the buffer, if there is one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() <= LENGTH_OFFSET {
            return None;
        }
        self.needed = self.buffer[LENGTH_OFFSET] as usize + FRAME_OVERHEAD;
        if self.buffer.len() < self.needed {
            return None;
        }
        let frame = self.buffer.split_to(self.needed).freeze();
        self.needed = 0;
        Some(Frame::new(frame))
    }

    /// Number of buffered bytes not yet released as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Size of the pending frame, 0 when its length is not yet known.
    pub fn needed(&self) -> usize {
        self.needed
    }

    /// Drop any partial frame, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.needed = 0;
    }
}

/// Iterator returned by [`FrameAssembler::feed`].
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.assembler.next_frame()
    }
}

// ============================================================================
// Outbound commands
// ============================================================================

/// Transmission mode requested by the device in its handshake and echoed back
/// in the mode-selection command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransmissionType {
    Fast,
    Continuous,
}

impl TransmissionType {
    pub fn from_bit(bit: u8) -> Self {
        if bit & 0x01 != 0 {
            TransmissionType::Continuous
        } else {
            TransmissionType::Fast
        }
    }

    pub fn to_bit(self) -> u8 {
        match self {
            TransmissionType::Fast => 0x00,
            TransmissionType::Continuous => 0x01,
        }
    }
}

const CMD_TRANSMODE: u8 = 0x55;
const CMD_ACK: u8 = 0xAA;
const CMD_HEARTBEAT: u8 = 0xFF;

/// Host-to-device commands written to the vendor write characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Answer to the handshake, required before any data flows.
    SelectTransmission(TransmissionType),
    /// Acknowledge a continuous-data chunk by sequence number.
    Acknowledge(u8),
    /// Keep-alive.
    Heartbeat,
}

impl Command {
    /// Encode the command including its trailing CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = match *self {
            Command::SelectTransmission(mode) => {
                vec![START_BYTE, CMD_TRANSMODE, 0x01, mode.to_bit()]
            }
            Command::Acknowledge(seq) => vec![START_BYTE, CMD_ACK, 0x02, seq, 0x00],
            Command::Heartbeat => vec![START_BYTE, CMD_HEARTBEAT, 0x01, 0x00],
        };
        out.push(crc8(&out));
        out
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SelectTransmission(_) => "transmission mode",
            Command::Acknowledge(_) => "acknowledgment",
            Command::Heartbeat => "heartbeat",
        }
    }
}
