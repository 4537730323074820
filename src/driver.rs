use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use num_traits::FromPrimitive;

use crate::config::LensConfig;
use crate::error::{LensError, Result};
use crate::mode::{FocalPowerRange, LensMode};
use crate::protocol::{self, Reply};
use crate::transport::{self, Transport};

/// Cancels a [`LensDriver`] session from another thread.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// The session closes its transport before its next command and fails
    /// every operation from then on.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An open, exclusive session on one lens driver.
///
/// The transport is released exactly once: by [`close`](Self::close), or on
/// drop. Both ramp the active output to zero first when the configuration
/// asks for it.
pub struct LensDriver {
    port: Option<Box<dyn Transport>>,
    config: LensConfig,
    firmware_type: String,
    firmware_version: (u8, u8, u16, u16),
    max_output_current: f64,
    mode: Option<LensMode>,
    focal_range: Option<FocalPowerRange>,
    cancel: CancelHandle,
}

impl LensDriver {
    /// Opens the device at `port_name` with default settings.
    pub fn open(port_name: &str, debug: bool) -> Result<Self> {
        Self::open_with(port_name, LensConfig::default().with_debug(debug))
    }

    pub fn open_with(port_name: &str, config: LensConfig) -> Result<Self> {
        let port = transport::open_serial(port_name, &config)?;
        let driver = Self::from_transport(port, config)?;
        info!("Opened lens driver at {}", port_name);
        Ok(driver)
    }

    /// Starts a session over an already open transport.
    pub fn from_transport(port: Box<dyn Transport>, config: LensConfig) -> Result<Self> {
        if config.debug {
            init_debug_logging();
        }

        let mut driver = LensDriver {
            port: Some(port),
            config,
            firmware_type: String::new(),
            firmware_version: (0, 0, 0, 0),
            max_output_current: 0.0,
            mode: None,
            focal_range: None,
            cancel: CancelHandle::default(),
        };

        driver.handshake()?;
        driver.init()?;

        Ok(driver)
    }

    /// Opens a session, runs `f` on it, and closes it whatever `f` returns.
    pub fn session<T, F>(port_name: &str, config: LensConfig, f: F) -> Result<T>
    where
        F: FnOnce(&mut LensDriver) -> Result<T>,
    {
        Self::open_with(port_name, config)?.scope(f)
    }

    /// Runs `f` on this session, then closes it. An error from `f` wins over
    /// an error from closing.
    pub fn scope<T, F>(mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LensDriver) -> Result<T>,
    {
        let result = f(&mut self);
        let closed = self.close();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Error while closing after failure: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Ramps the output down if configured, then releases the transport.
    pub fn close(mut self) -> Result<()> {
        let result = self.soft_close();
        self.release();
        result
    }

    fn handshake(&mut self) -> Result<()> {
        debug!("Performing handshake");
        let port = self.port()?;
        port.write_all(protocol::HANDSHAKE_REQUEST)
            .map_err(LensError::HandshakeIo)?;

        let mut response = [0u8; 7];
        port.read_exact(&mut response)
            .map_err(LensError::HandshakeIo)?;

        if &response != protocol::HANDSHAKE_REPLY {
            return Err(LensError::HandshakeFailed(response.to_vec()));
        }

        debug!("Handshake successful");
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.firmware_type = self.get_firmware_type()?;
        self.firmware_version = self.get_firmware_version()?;
        self.max_output_current = self.get_max_output_current()?;
        info!(
            "Lens driver firmware {} {:?}, max output current {} mA",
            self.firmware_type, self.firmware_version, self.max_output_current
        );
        Ok(())
    }

    /// Mode commanded or observed during this session; `None` right after open.
    pub fn mode(&self) -> Option<LensMode> {
        self.mode
    }

    /// Focal power bounds reported when focal power mode was entered.
    pub fn focal_range(&self) -> Option<FocalPowerRange> {
        self.focal_range
    }

    /// Get the firmware type
    pub fn firmware_type(&self) -> &str {
        &self.firmware_type
    }

    /// Get the firmware version
    pub fn firmware_version(&self) -> (u8, u8, u16, u16) {
        self.firmware_version
    }

    /// Get the maximum output current
    pub fn max_output_current(&self) -> f64 {
        self.max_output_current
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn get_firmware_type(&mut self) -> Result<String> {
        debug!("Getting firmware type");
        let response = self.send_command(b"H", Some(protocol::FIRMWARE_TYPE))?;
        Ok(String::from_utf8_lossy(&response).to_string())
    }

    fn get_firmware_version(&mut self) -> Result<(u8, u8, u16, u16)> {
        debug!("Getting firmware version");
        let response = self.send_command(b"V\x00", Some(protocol::FIRMWARE_VERSION))?;
        Ok((
            response[0],
            response[1],
            protocol::be_u16(&response, 2),
            protocol::be_u16(&response, 4),
        ))
    }

    fn get_max_output_current(&mut self) -> Result<f64> {
        debug!("Getting maximum output current");
        let response = self.send_command(b"CrMA\x00\x00", Some(protocol::MAX_CURRENT))?;
        let max_current = protocol::be_u16(&response, 0) as f64 / 100.0;
        debug!("Maximum output current: {} mA", max_current);
        Ok(max_current)
    }

    pub fn firmware_branch(&mut self) -> Result<u8> {
        let response = self.send_command(b"F", Some(protocol::FIRMWARE_BRANCH))?;
        Ok(response[0])
    }

    pub fn part_number(&mut self) -> Result<Vec<u8>> {
        self.send_command(b"J", Some(protocol::PART_NUMBER))
    }

    pub fn serial_number(&mut self) -> Result<String> {
        let response = self.send_command(b"X", Some(protocol::SERIAL_NUMBER))?;
        Ok(String::from_utf8_lossy(&response)
            .trim_end_matches('\0')
            .to_string())
    }

    pub fn device_id(&mut self) -> Result<Vec<u8>> {
        self.send_command(b"IR\x00\x00\x00\x00\x00\x00\x00\x00", Some(protocol::DEVICE_ID))
    }

    /// Sets the hardware current ceiling, at most 292.84 mA.
    pub fn set_max_output_current(&mut self, max_current: f64) -> Result<f64> {
        if !(max_current > 0.0 && max_current <= protocol::MAX_OUTPUT_CURRENT_LIMIT) {
            return Err(LensError::OutOfRange {
                what: "max output current",
                value: max_current,
                min: 0.0,
                max: protocol::MAX_OUTPUT_CURRENT_LIMIT,
            });
        }

        let raw = (max_current * 100.0) as u16;
        let cmd = protocol::command(b"CwMA", &[&raw.to_be_bytes()]);
        let response = self.send_command(&cmd, Some(protocol::MAX_CURRENT))?;
        self.max_output_current = protocol::be_u16(&response, 0) as f64 / 100.0;
        info!("Maximum output current set to {} mA", self.max_output_current);
        Ok(self.max_output_current)
    }

    pub fn get_temperature(&mut self) -> Result<f64> {
        debug!("Getting temperature");
        let response = self.send_command(b"TCA", Some(protocol::TEMPERATURE))?;
        let temp = protocol::raw_to_temperature(protocol::be_i16(&response, 0));
        debug!("Temperature: {}°C", temp);
        Ok(temp)
    }

    /// Sets the temperature window and returns the focal power range the
    /// lens can reach inside it.
    pub fn set_temperature_limits(&mut self, lower: f64, upper: f64) -> Result<FocalPowerRange> {
        if !(lower.is_finite() && upper.is_finite()) || lower > upper {
            return Err(LensError::OutOfRange {
                what: "lower temperature limit",
                value: lower,
                min: f64::NEG_INFINITY,
                max: upper,
            });
        }

        let upper_raw = temperature_raw(upper)?;
        let lower_raw = temperature_raw(lower)?;

        info!("Setting temperature limits to {}..{}°C", lower, upper);
        let cmd = protocol::command(b"PwTA", &[&upper_raw.to_be_bytes(), &lower_raw.to_be_bytes()]);
        let response = self.send_command(&cmd, Some(protocol::TEMPERATURE_LIMITS))?;
        let max = protocol::raw_to_diopter(protocol::be_i16(&response, 0), &self.firmware_type);
        let min = protocol::raw_to_diopter(protocol::be_i16(&response, 2), &self.firmware_type);
        FocalPowerRange::new(min, max)
            .ok_or_else(|| LensError::malformed(b"PwTA", "inverted focal power range"))
    }

    /// Temperature window as `(lower, upper)` in °C.
    pub fn temperature_limits(&mut self) -> Result<(f64, f64)> {
        let response = self.send_command(b"PrTA\x00\x00\x00\x00", Some(protocol::TEMPERATURE_LIMITS))?;
        let upper = protocol::raw_to_temperature(protocol::be_i16(&response, 0));
        let lower = protocol::raw_to_temperature(protocol::be_i16(&response, 2));
        Ok((lower, upper))
    }

    pub fn gain(&mut self) -> Result<f64> {
        let response = self.send_command(b"Or\x00\x00", Some(protocol::GAIN))?;
        Ok(protocol::be_u16(&response, 0) as f64 / 100.0)
    }

    /// Sets the focal power gain (0 to 5) and returns the focal power range
    /// the lens reports for it.
    pub fn set_gain(&mut self, gain: f64) -> Result<Option<FocalPowerRange>> {
        if !(0.0..=5.0).contains(&gain) {
            return Err(LensError::OutOfRange {
                what: "gain",
                value: gain,
                min: 0.0,
                max: 5.0,
            });
        }

        let raw = (gain * 100.0) as u16;
        let cmd = protocol::command(b"Ow", &[&raw.to_be_bytes()]);
        let response = self.send_command(&cmd, Some(protocol::GAIN_STATUS))?;
        let status = response[0];
        let max_fp = protocol::raw_to_diopter(protocol::be_i16(&response, 1), &self.firmware_type);
        let min_fp = protocol::raw_to_diopter(protocol::be_i16(&response, 3), &self.firmware_type);
        info!(
            "Gain set to {}, status {}, focal power range {} to {}",
            gain, status, min_fp, max_fp
        );

        let range = FocalPowerRange::new(min_fp, max_fp);
        if range.is_none() {
            warn!("Ignoring unusable focal power range {} to {}", min_fp, max_fp);
        }
        if self.mode == Some(LensMode::FocalPower) {
            self.focal_range = range;
        }
        Ok(range)
    }

    pub fn set_mode(&mut self, mode: LensMode) -> Result<Option<FocalPowerRange>> {
        info!("Setting mode to {}", mode);
        let command = mode
            .switch_command()
            .ok_or_else(|| LensError::InvalidMode(mode.to_string()))?;

        match mode {
            LensMode::FocalPower => {
                let response = self.send_command(command, Some(protocol::FOCAL_RANGE))?;
                self.mode = Some(LensMode::FocalPower);

                let max_fp = protocol::raw_to_diopter(protocol::be_i16(&response, 0), &self.firmware_type);
                let min_fp = protocol::raw_to_diopter(protocol::be_i16(&response, 2), &self.firmware_type);

                self.focal_range = FocalPowerRange::new(min_fp, max_fp);
                match self.focal_range {
                    Some(_) => debug!("Focal power range: {} to {}", min_fp, max_fp),
                    None => warn!("Ignoring unusable focal power range {} to {}", min_fp, max_fp),
                }
                Ok(self.focal_range)
            }
            _ => {
                self.send_command(command, None)?;
                self.mode = Some(mode);
                self.focal_range = None;
                Ok(None)
            }
        }
    }

    /// Parses a mode name such as `"current"` or `"focal_power"` and switches to it.
    pub fn set_mode_str(&mut self, mode: &str) -> Result<Option<FocalPowerRange>> {
        let mode: LensMode = mode.parse()?;
        self.set_mode(mode)
    }

    /// Reads the device's active mode and adopts it for this session.
    pub fn refresh_mode(&mut self) -> Result<Option<LensMode>> {
        debug!("Refreshing active mode");
        let response = self.send_command(b"MMA", Some(protocol::ACTIVE_MODE))?;
        let mode = LensMode::from_u8(response[0]);
        if mode.is_none() {
            warn!("Device reported unknown mode code {}", response[0]);
        }
        if mode != self.mode {
            self.focal_range = None;
        }
        self.mode = mode;
        Ok(mode)
    }

    pub fn get_current(&mut self) -> Result<f64> {
        debug!("Getting current");
        let response = self.send_command(b"Ar\x00\x00", Some(protocol::CURRENT))?;
        let current = protocol::raw_to_current(protocol::be_i16(&response, 0), self.max_output_current);
        debug!("Current: {} mA", current);
        Ok(current)
    }

    pub fn set_current(&mut self, current: f64) -> Result<()> {
        debug!("Setting current to {} mA", current);
        self.require_mode(LensMode::Current)?;
        self.check_current("current", current)?;
        self.write_current(current)
    }

    fn write_current(&mut self, current: f64) -> Result<()> {
        let raw_current = protocol::current_to_raw(current, self.max_output_current);
        let cmd = protocol::command(b"Aw", &[&raw_current.to_be_bytes()]);
        self.send_command(&cmd, None).map(|_| ())
    }

    pub fn get_diopter(&mut self) -> Result<f64> {
        debug!("Getting diopter");
        let response = self.send_command(b"PrDA\x00\x00\x00\x00", Some(protocol::DIOPTER))?;
        let diopter = protocol::raw_to_diopter(protocol::be_i16(&response, 0), &self.firmware_type);
        debug!("Diopter: {}", diopter);
        Ok(diopter)
    }

    pub fn set_diopter(&mut self, diopter: f64) -> Result<()> {
        debug!("Setting diopter to {}", diopter);
        self.require_mode(LensMode::FocalPower)?;

        // Without a reported range, the 16-bit wire field is the only bound.
        let (min, max) = self.focal_range.map_or_else(
            || {
                (
                    protocol::raw_to_diopter(i16::MIN, &self.firmware_type),
                    protocol::raw_to_diopter(i16::MAX, &self.firmware_type),
                )
            },
            Into::into,
        );
        if !(diopter >= min && diopter <= max) {
            return Err(LensError::OutOfRange {
                what: "focal power",
                value: diopter,
                min,
                max,
            });
        }

        self.write_diopter(diopter)
    }

    fn write_diopter(&mut self, diopter: f64) -> Result<()> {
        let raw_diopter = protocol::diopter_to_raw(diopter, &self.firmware_type).ok_or_else(|| {
            LensError::OutOfRange {
                what: "focal power",
                value: diopter,
                min: protocol::raw_to_diopter(i16::MIN, &self.firmware_type),
                max: protocol::raw_to_diopter(i16::MAX, &self.firmware_type),
            }
        })?;
        let cmd = protocol::command(b"PwDA", &[&raw_diopter.to_be_bytes(), &[0, 0]]);
        self.send_command(&cmd, None).map(|_| ())
    }

    pub fn current_upper_limit(&mut self) -> Result<f64> {
        self.read_current_limit(b"CrUA\x00\x00")
    }

    pub fn set_current_upper_limit(&mut self, limit: f64) -> Result<f64> {
        self.write_current_limit(b"CwUA", "upper current limit", limit)
    }

    pub fn current_lower_limit(&mut self) -> Result<f64> {
        self.read_current_limit(b"CrLA\x00\x00")
    }

    pub fn set_current_lower_limit(&mut self, limit: f64) -> Result<f64> {
        self.write_current_limit(b"CwLA", "lower current limit", limit)
    }

    fn read_current_limit(&mut self, command: &[u8]) -> Result<f64> {
        let response = self.send_command(command, Some(protocol::CURRENT_LIMIT))?;
        Ok(protocol::raw_to_current(protocol::be_i16(&response, 0), self.max_output_current))
    }

    fn write_current_limit(&mut self, mnemonic: &[u8], what: &'static str, limit: f64) -> Result<f64> {
        self.check_current(what, limit)?;
        let raw = protocol::current_to_raw(limit, self.max_output_current);
        let cmd = protocol::command(mnemonic, &[&raw.to_be_bytes()]);
        let response = self.send_command(&cmd, Some(protocol::CURRENT_LIMIT))?;
        let applied = protocol::raw_to_current(protocol::be_i16(&response, 0), self.max_output_current);
        info!("Set {} to {} mA", what, applied);
        Ok(applied)
    }

    pub fn signal_upper(&mut self) -> Result<f64> {
        self.read_signal_limit(b"PrUA\x00\x00\x00\x00")
    }

    pub fn set_signal_upper(&mut self, current: f64) -> Result<()> {
        self.write_signal_limit(b"PwUA", "signal generator upper swing", current)
    }

    pub fn signal_lower(&mut self) -> Result<f64> {
        self.read_signal_limit(b"PrLA\x00\x00\x00\x00")
    }

    pub fn set_signal_lower(&mut self, current: f64) -> Result<()> {
        self.write_signal_limit(b"PwLA", "signal generator lower swing", current)
    }

    fn read_signal_limit(&mut self, command: &[u8]) -> Result<f64> {
        let response = self.send_command(command, Some(protocol::SIGNAL_LIMIT))?;
        Ok(protocol::raw_to_current(protocol::be_i16(&response, 0), self.max_output_current))
    }

    fn write_signal_limit(&mut self, mnemonic: &[u8], what: &'static str, current: f64) -> Result<()> {
        self.check_current(what, current)?;
        let raw = protocol::current_to_raw(current, self.max_output_current);
        let cmd = protocol::command(mnemonic, &[&raw.to_be_bytes(), &[0, 0]]);
        self.send_command(&cmd, None).map(|_| ())
    }

    /// Signal generator frequency in Hz.
    pub fn signal_frequency(&mut self) -> Result<f64> {
        let response = self.send_command(b"PrFA\x00\x00\x00\x00", Some(protocol::SIGNAL_FREQUENCY))?;
        Ok(protocol::be_u32(&response, 0) as f64 / 1000.0)
    }

    pub fn set_signal_frequency(&mut self, hertz: f64) -> Result<()> {
        let max = u32::MAX as f64 / 1000.0;
        if !(hertz >= 0.0 && hertz <= max) {
            return Err(LensError::OutOfRange {
                what: "signal generator frequency",
                value: hertz,
                min: 0.0,
                max,
            });
        }
        let raw = (hertz * 1000.0) as u32;
        let cmd = protocol::command(b"PwFA", &[&raw.to_be_bytes()]);
        self.send_command(&cmd, None).map(|_| ())
    }

    pub fn ramp_to_zero(&mut self, duration: f64, steps: usize) -> Result<()> {
        let duration = Duration::try_from_secs_f64(duration).map_err(|_| LensError::OutOfRange {
            what: "ramp duration",
            value: duration,
            min: 0.0,
            max: Duration::MAX.as_secs_f64(),
        })?;
        self.ramp_output_to_zero(duration, steps)
    }

    fn ramp_output_to_zero(&mut self, duration: Duration, steps: usize) -> Result<()> {
        debug!("Ramping to zero over {:?} with {} steps", duration, steps);

        let (start_value, end_value, set_func): (f64, f64, fn(&mut Self, f64) -> Result<()>) =
            match self.mode {
                Some(LensMode::Current) => (self.get_current()?, 0.0, Self::write_current),
                Some(LensMode::FocalPower) => {
                    // Zero may lie outside what the lens can reach.
                    let end = self.focal_range.map_or(0.0, |r| 0.0_f64.clamp(r.min, r.max));
                    (self.get_diopter()?, end, Self::write_diopter)
                }
                other => {
                    error!("Cannot ramp to zero: no output mode active");
                    return Err(LensError::InvalidMode(
                        other.map_or_else(|| "unknown".to_string(), |m| m.to_string()),
                    ));
                }
            };

        self.ramp(start_value, end_value, duration, steps, set_func)?;
        info!("Ramp to zero complete");
        Ok(())
    }

    fn ramp(
        &mut self,
        start: f64,
        end: f64,
        duration: Duration,
        steps: usize,
        set_func: fn(&mut Self, f64) -> Result<()>,
    ) -> Result<()> {
        let steps = steps.max(1);
        let step_size = (end - start) / steps as f64;
        let step_duration = duration.div_f64(steps as f64);

        for i in 0..=steps {
            let target_value = if i == steps {
                end
            } else {
                start + (i as f64) * step_size
            };
            set_func(self, target_value)?;
            if i < steps {
                thread::sleep(step_duration);
            }
        }
        Ok(())
    }

    fn require_mode(&self, expected: LensMode) -> Result<()> {
        if self.mode != Some(expected) {
            return Err(LensError::WrongMode {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }

    fn check_current(&self, what: &'static str, value: f64) -> Result<()> {
        let max = self.max_output_current;
        if value.is_finite() && value.abs() <= max {
            Ok(())
        } else {
            Err(LensError::OutOfRange {
                what,
                value,
                min: -max,
                max,
            })
        }
    }

    fn soft_close(&mut self) -> Result<()> {
        let Some(ramp) = self.config.close_ramp else {
            return Ok(());
        };
        if self.port.is_none() || self.cancel.is_cancelled() {
            return Ok(());
        }
        match self.mode {
            Some(LensMode::Current) | Some(LensMode::FocalPower) => {
                self.ramp_output_to_zero(ramp.duration, ramp.steps)
            }
            _ => Ok(()),
        }
    }

    fn release(&mut self) {
        if let Some(port) = self.port.take() {
            drop(port);
            info!("Lens session closed");
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn Transport>> {
        if self.cancel.is_cancelled() && self.port.is_some() {
            warn!("Session cancelled, closing transport");
            self.release();
        }
        self.port.as_mut().ok_or(LensError::Cancelled)
    }

    fn send_command(&mut self, command: &[u8], reply: Option<Reply>) -> Result<Vec<u8>> {
        let framed = protocol::frame(command);
        debug!("Sending command: {:?}", framed);

        let port = self.port()?;
        port.write_all(&framed)?;

        let Some(shape) = reply else {
            return Ok(Vec::new());
        };

        let mut response = vec![0u8; shape.frame_len()];
        port.read_exact(&mut response)?;
        protocol::parse_reply(command, shape, &response)
    }
}

impl Drop for LensDriver {
    fn drop(&mut self) {
        if self.port.is_none() {
            return;
        }
        info!("Dropping LensDriver");
        if let Err(e) = self.soft_close() {
            error!("Error while ramping to zero during drop: {}", e);
        }
        self.release();
    }
}

fn temperature_raw(celsius: f64) -> Result<i16> {
    protocol::temperature_to_raw(celsius).ok_or(LensError::OutOfRange {
        what: "temperature limit",
        value: celsius,
        min: protocol::raw_to_temperature(i16::MIN),
        max: protocol::raw_to_temperature(i16::MAX),
    })
}

fn init_debug_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .try_init()
        .ok();
}
