//! Command framing for the lens driver serial protocol.
//!
//! Commands are ASCII mnemonics followed by big-endian arguments and a
//! little-endian CRC-16/ARC. Replies have a fixed length per query: a short
//! header, the payload, the CRC of both, and `\r\n`.

use crc::{Crc, CRC_16_ARC};

use crate::error::{LensError, Result};

const CRC_16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub const HANDSHAKE_REQUEST: &[u8] = b"Start";
pub const HANDSHAKE_REPLY: &[u8; 7] = b"Ready\r\n";
pub const TERMINATOR: &[u8; 2] = b"\r\n";

/// Largest max-output-current the driver hardware accepts, in mA.
pub const MAX_OUTPUT_CURRENT_LIMIT: f64 = 292.84;

/// Shape of a fixed-length reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    pub header: usize,
    pub payload: usize,
}

impl Reply {
    pub const fn new(header: usize, payload: usize) -> Self {
        Reply { header, payload }
    }

    /// Bytes on the wire, including CRC and terminator.
    pub const fn frame_len(&self) -> usize {
        self.header + self.payload + 2 + TERMINATOR.len()
    }
}

pub const FIRMWARE_TYPE: Reply = Reply::new(1, 1);
pub const FIRMWARE_VERSION: Reply = Reply::new(1, 6);
pub const FIRMWARE_BRANCH: Reply = Reply::new(1, 1);
pub const PART_NUMBER: Reply = Reply::new(1, 3);
pub const SERIAL_NUMBER: Reply = Reply::new(1, 8);
pub const DEVICE_ID: Reply = Reply::new(2, 8);
pub const MAX_CURRENT: Reply = Reply::new(3, 2);
pub const CURRENT_LIMIT: Reply = Reply::new(3, 2);
pub const TEMPERATURE: Reply = Reply::new(3, 2);
pub const ACTIVE_MODE: Reply = Reply::new(3, 1);
pub const FOCAL_RANGE: Reply = Reply::new(1, 4);
pub const CURRENT: Reply = Reply::new(1, 2);
pub const DIOPTER: Reply = Reply::new(2, 2);
pub const SIGNAL_LIMIT: Reply = Reply::new(3, 2);
pub const SIGNAL_FREQUENCY: Reply = Reply::new(3, 4);
pub const TEMPERATURE_LIMITS: Reply = Reply::new(3, 4);
pub const GAIN: Reply = Reply::new(2, 2);
/// Status byte followed by the focal power range.
pub const GAIN_STATUS: Reply = Reply::new(2, 5);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_16.checksum(data)
}

/// Appends the CRC to a command.
pub fn frame(command: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(command.len() + 2);
    framed.extend_from_slice(command);
    framed.extend_from_slice(&crc16(command).to_le_bytes());
    framed
}

/// Builds a reply frame around `body` (header and payload).
pub fn frame_reply(body: &[u8]) -> Vec<u8> {
    let mut framed = frame(body);
    framed.extend_from_slice(TERMINATOR);
    framed
}

/// Concatenates a mnemonic with its argument bytes.
pub fn command(mnemonic: &[u8], args: &[&[u8]]) -> Vec<u8> {
    let mut cmd = Vec::from(mnemonic);
    for arg in args {
        cmd.extend_from_slice(arg);
    }
    cmd
}

/// Validates a raw reply and returns its payload.
pub fn parse_reply(command: &[u8], shape: Reply, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() != shape.frame_len() {
        return Err(LensError::malformed(command, "unexpected reply length"));
    }

    let (body, trailer) = raw.split_at(shape.header + shape.payload);
    if &trailer[2..] != TERMINATOR {
        return Err(LensError::malformed(command, "missing terminator"));
    }

    let crc_received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if crc_received != crc16(body) {
        return Err(LensError::CrcError);
    }

    Ok(body[shape.header..].to_vec())
}

pub fn be_i16(payload: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([payload[at], payload[at + 1]])
}

pub fn be_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([payload[at], payload[at + 1]])
}

pub fn be_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

/// Drive currents travel as a fraction of the max output current over 4095.
pub fn current_to_raw(current: f64, max_output_current: f64) -> i16 {
    (current * 4095.0 / max_output_current) as i16
}

pub fn raw_to_current(raw: i16, max_output_current: f64) -> f64 {
    raw as f64 * max_output_current / 4095.0
}

/// Truncates into a signed 16-bit field; `None` when the value does not fit.
fn fit_i16(scaled: f64) -> Option<i16> {
    let truncated = scaled.trunc();
    (truncated >= i16::MIN as f64 && truncated <= i16::MAX as f64).then_some(truncated as i16)
}

pub fn temperature_to_raw(celsius: f64) -> Option<i16> {
    fit_i16(celsius * 16.0)
}

pub fn raw_to_temperature(raw: i16) -> f64 {
    raw as f64 * 0.0625
}

/// Firmware type `A` offsets focal power by +5 dpt on the wire.
pub fn diopter_offset(firmware_type: &str) -> f64 {
    if firmware_type == "A" {
        5.0
    } else {
        0.0
    }
}

pub fn diopter_to_raw(diopter: f64, firmware_type: &str) -> Option<i16> {
    fit_i16((diopter + diopter_offset(firmware_type)) * 200.0)
}

pub fn raw_to_diopter(raw: i16, firmware_type: &str) -> f64 {
    raw as f64 / 200.0 - diopter_offset(firmware_type)
}
