//! In-memory lens driver that answers the serial protocol.
//!
//! [`SimulatedLens`] implements [`Transport`](crate::Transport), so a
//! [`LensDriver`](crate::LensDriver) can run against it exactly as it runs
//! against a serial port. A [`SimHandle`] stays with the caller to inspect the
//! device state, inject faults, and count how often the transport was closed.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::protocol::{self, Reply};

/// Misbehaviours the simulated device can be told to show.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Faults {
    /// Answer the handshake with something other than `Ready`.
    pub reject_handshake: bool,
    /// Stop answering altogether; every read times out.
    pub silent: bool,
    /// Flip a bit of the CRC in every reply.
    pub corrupt_crc: bool,
    /// Report the focal power bounds swapped.
    pub inverted_focal_range: bool,
}

#[derive(Debug)]
struct DeviceState {
    firmware_type: u8,
    firmware_version: (u8, u8, u16, u16),
    firmware_branch: u8,
    part_number: [u8; 3],
    serial_number: [u8; 8],
    device_id: [u8; 8],
    max_current_raw: u16,
    temperature_raw: i16,
    mode: u8,
    current_raw: i16,
    diopter_raw: i16,
    focal_range: (f64, f64),
    current_upper_raw: i16,
    current_lower_raw: i16,
    signal_upper_raw: i16,
    signal_lower_raw: i16,
    signal_frequency_raw: u32,
    temperature_limits_raw: (i16, i16),
    gain_raw: u16,
    faults: Faults,
    commands: Vec<Vec<u8>>,
    closed: usize,
    pending: VecDeque<u8>,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            firmware_type: b'A',
            firmware_version: (1, 2, 3, 4),
            firmware_branch: 1,
            part_number: *b"LD4",
            serial_number: *b"SIM00001",
            device_id: *b"SIMLENS1",
            max_current_raw: 29284,
            temperature_raw: temperature_register(25.0),
            // The device comes up in current mode from a previous session.
            mode: 1,
            current_raw: 0,
            diopter_raw: diopter_register(0.0, "A"),
            focal_range: (-2.0, 3.0),
            current_upper_raw: 4095,
            current_lower_raw: -4095,
            signal_upper_raw: 0,
            signal_lower_raw: 0,
            signal_frequency_raw: 0,
            temperature_limits_raw: (0, 0),
            gain_raw: 0,
            faults: Faults::default(),
            commands: Vec::new(),
            closed: 0,
            pending: VecDeque::new(),
        }
    }
}

impl DeviceState {
    fn firmware_label(&self) -> String {
        String::from(self.firmware_type as char)
    }

    fn max_output_current(&self) -> f64 {
        self.max_current_raw as f64 / 100.0
    }

    fn receive(&mut self, frame: &[u8]) {
        if frame == protocol::HANDSHAKE_REQUEST {
            self.commands.push(frame.to_vec());
            if self.faults.silent {
                return;
            }
            let reply: &[u8] = if self.faults.reject_handshake {
                b"Busy!\r\n"
            } else {
                protocol::HANDSHAKE_REPLY
            };
            self.pending.extend(reply);
            return;
        }

        if frame.len() < 3 {
            warn!("Simulated lens ignoring short frame {:?}", frame);
            return;
        }
        let (cmd, crc) = frame.split_at(frame.len() - 2);
        if u16::from_le_bytes([crc[0], crc[1]]) != protocol::crc16(cmd) {
            warn!("Simulated lens ignoring frame with bad CRC {:?}", frame);
            return;
        }

        self.commands.push(cmd.to_vec());
        if let Some((shape, payload)) = self.execute(cmd) {
            if !self.faults.silent {
                self.respond(cmd, shape, &payload);
            }
        }
    }

    fn respond(&mut self, cmd: &[u8], shape: Reply, payload: &[u8]) {
        debug_assert_eq!(payload.len(), shape.payload);
        let mut body = echo_header(cmd, shape.header);
        body.extend_from_slice(payload);
        let mut framed = protocol::frame_reply(&body);
        if self.faults.corrupt_crc {
            framed[body.len()] ^= 0x01;
        }
        self.pending.extend(framed);
    }

    fn execute(&mut self, cmd: &[u8]) -> Option<(Reply, Vec<u8>)> {
        let fw = self.firmware_label();
        let max = self.max_output_current();
        match cmd {
            b"H" => Some((protocol::FIRMWARE_TYPE, vec![self.firmware_type])),
            [b'V', ..] => {
                let (major, minor, build, revision) = self.firmware_version;
                let mut payload = vec![major, minor];
                payload.extend_from_slice(&build.to_be_bytes());
                payload.extend_from_slice(&revision.to_be_bytes());
                Some((protocol::FIRMWARE_VERSION, payload))
            }
            b"F" => Some((protocol::FIRMWARE_BRANCH, vec![self.firmware_branch])),
            b"J" => Some((protocol::PART_NUMBER, self.part_number.to_vec())),
            b"X" => Some((protocol::SERIAL_NUMBER, self.serial_number.to_vec())),
            [b'I', b'R', ..] => Some((protocol::DEVICE_ID, self.device_id.to_vec())),
            [b'C', b'r', b'M', b'A', ..] => Some((
                protocol::MAX_CURRENT,
                self.max_current_raw.to_be_bytes().to_vec(),
            )),
            &[b'C', b'w', b'M', b'A', hi, lo] => {
                self.max_current_raw = u16::from_be_bytes([hi, lo]);
                Some((
                    protocol::MAX_CURRENT,
                    self.max_current_raw.to_be_bytes().to_vec(),
                ))
            }
            &[b'C', b'r', which @ (b'U' | b'L'), b'A', ..] => Some((
                protocol::CURRENT_LIMIT,
                self.current_limit(which).to_be_bytes().to_vec(),
            )),
            &[b'C', b'w', which @ (b'U' | b'L'), b'A', hi, lo] => {
                let raw = i16::from_be_bytes([hi, lo]);
                if which == b'U' {
                    self.current_upper_raw = raw;
                } else {
                    self.current_lower_raw = raw;
                }
                Some((protocol::CURRENT_LIMIT, raw.to_be_bytes().to_vec()))
            }
            b"TCA" => Some((
                protocol::TEMPERATURE,
                self.temperature_raw.to_be_bytes().to_vec(),
            )),
            b"MMA" => Some((protocol::ACTIVE_MODE, vec![self.mode])),
            &[b'M', b'w', code, b'A'] => self.switch_mode(code, &fw),
            [b'A', b'r', ..] => Some((protocol::CURRENT, self.current_raw.to_be_bytes().to_vec())),
            &[b'A', b'w', hi, lo] => {
                self.current_raw = i16::from_be_bytes([hi, lo]);
                debug!(
                    "Simulated lens current now {} mA",
                    protocol::raw_to_current(self.current_raw, max)
                );
                None
            }
            [b'P', b'r', b'D', b'A', ..] => {
                Some((protocol::DIOPTER, self.diopter_raw.to_be_bytes().to_vec()))
            }
            &[b'P', b'w', b'D', b'A', hi, lo, ..] => {
                self.diopter_raw = i16::from_be_bytes([hi, lo]);
                None
            }
            &[b'P', b'r', which @ (b'U' | b'L'), b'A', ..] => {
                let raw = if which == b'U' {
                    self.signal_upper_raw
                } else {
                    self.signal_lower_raw
                };
                Some((protocol::SIGNAL_LIMIT, raw.to_be_bytes().to_vec()))
            }
            &[b'P', b'w', which @ (b'U' | b'L'), b'A', hi, lo, ..] => {
                let raw = i16::from_be_bytes([hi, lo]);
                if which == b'U' {
                    self.signal_upper_raw = raw;
                } else {
                    self.signal_lower_raw = raw;
                }
                None
            }
            [b'P', b'r', b'F', b'A', ..] => Some((
                protocol::SIGNAL_FREQUENCY,
                self.signal_frequency_raw.to_be_bytes().to_vec(),
            )),
            &[b'P', b'w', b'F', b'A', a, b, c, d] => {
                self.signal_frequency_raw = u32::from_be_bytes([a, b, c, d]);
                None
            }
            &[b'P', b'w', b'T', b'A', upper_hi, upper_lo, lower_hi, lower_lo] => {
                self.temperature_limits_raw = (
                    i16::from_be_bytes([lower_hi, lower_lo]),
                    i16::from_be_bytes([upper_hi, upper_lo]),
                );
                Some((protocol::TEMPERATURE_LIMITS, self.focal_range_payload(&fw)))
            }
            [b'P', b'r', b'T', b'A', ..] => {
                let (lower, upper) = self.temperature_limits_raw;
                let mut payload = upper.to_be_bytes().to_vec();
                payload.extend_from_slice(&lower.to_be_bytes());
                Some((protocol::TEMPERATURE_LIMITS, payload))
            }
            [b'O', b'r', ..] => Some((protocol::GAIN, self.gain_raw.to_be_bytes().to_vec())),
            &[b'O', b'w', hi, lo] => {
                self.gain_raw = u16::from_be_bytes([hi, lo]);
                let mut payload = vec![0];
                payload.extend(self.focal_range_payload(&fw));
                Some((protocol::GAIN_STATUS, payload))
            }
            _ => {
                warn!("Simulated lens ignoring unknown command {:?}", cmd);
                None
            }
        }
    }

    fn current_limit(&self, which: u8) -> i16 {
        if which == b'U' {
            self.current_upper_raw
        } else {
            self.current_lower_raw
        }
    }

    fn switch_mode(&mut self, code: u8, fw: &str) -> Option<(Reply, Vec<u8>)> {
        let mode = match code {
            b'D' => 1,
            b'S' => 2,
            b'T' => 3,
            b'Q' => 4,
            b'C' => 5,
            b'A' => 6,
            _ => {
                warn!("Simulated lens ignoring unknown mode code {}", code as char);
                return None;
            }
        };
        self.mode = mode;
        if mode == 5 {
            Some((protocol::FOCAL_RANGE, self.focal_range_payload(fw)))
        } else {
            None
        }
    }

    /// Max bound first, then min, as the device sends them.
    fn focal_range_payload(&self, fw: &str) -> Vec<u8> {
        let (mut min, mut max) = self.focal_range;
        if self.faults.inverted_focal_range {
            std::mem::swap(&mut min, &mut max);
        }
        let mut payload = diopter_register(max, fw).to_be_bytes().to_vec();
        payload.extend_from_slice(&diopter_register(min, fw).to_be_bytes());
        payload
    }
}

// The device registers saturate rather than reject.
fn diopter_register(diopter: f64, fw: &str) -> i16 {
    ((diopter + protocol::diopter_offset(fw)) * 200.0) as i16
}

fn temperature_register(celsius: f64) -> i16 {
    (celsius * 16.0) as i16
}

/// Header echoed in replies: the mnemonic without its read/write letter.
fn echo_header(cmd: &[u8], len: usize) -> Vec<u8> {
    let mut letters: Vec<u8> = cmd.to_vec();
    if letters.len() > 1 && matches!(letters[1], b'r' | b'w') {
        letters.remove(1);
    }
    letters.resize(len.max(letters.len()), b' ');
    letters.truncate(len);
    letters
}

/// A lens driver that lives in memory.
#[derive(Debug, Default)]
pub struct SimulatedLens {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedLens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Read for SimulatedLens {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state();
        if state.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
        }
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedLens {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state().receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SimulatedLens {
    fn drop(&mut self) {
        let mut state = self.state();
        state.closed += 1;
        debug!("Simulated lens closed ({} total)", state.closed);
    }
}

/// Shared view of a [`SimulatedLens`] that outlives the session using it.
#[derive(Clone, Debug)]
pub struct SimHandle {
    state: Arc<Mutex<DeviceState>>,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Times the transport was dropped.
    pub fn closed_count(&self) -> usize {
        self.state().closed
    }

    /// Every accepted command, without CRC.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state().commands.clone()
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    pub fn set_firmware_type(&self, firmware_type: u8) {
        let mut state = self.state();
        let diopter = protocol::raw_to_diopter(state.diopter_raw, &state.firmware_label());
        state.firmware_type = firmware_type;
        state.diopter_raw = diopter_register(diopter, &state.firmware_label());
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.state().temperature_raw = temperature_register(celsius);
    }

    pub fn set_focal_range(&self, min: f64, max: f64) {
        self.state().focal_range = (min, max);
    }

    /// Device mode by wire code.
    pub fn mode(&self) -> u8 {
        self.state().mode
    }

    pub fn set_mode(&self, code: u8) {
        self.state().mode = code;
    }

    pub fn current(&self) -> f64 {
        let state = self.state();
        protocol::raw_to_current(state.current_raw, state.max_output_current())
    }

    pub fn diopter(&self) -> f64 {
        let state = self.state();
        protocol::raw_to_diopter(state.diopter_raw, &state.firmware_label())
    }

    pub fn set_diopter(&self, diopter: f64) {
        let mut state = self.state();
        state.diopter_raw = diopter_register(diopter, &state.firmware_label());
    }

    pub fn gain(&self) -> f64 {
        self.state().gain_raw as f64 / 100.0
    }

    /// `(lower, upper)` in °C.
    pub fn temperature_limits(&self) -> (f64, f64) {
        let (lower, upper) = self.state().temperature_limits_raw;
        (
            protocol::raw_to_temperature(lower),
            protocol::raw_to_temperature(upper),
        )
    }
}
