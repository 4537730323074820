use std::io::{Read, Write};

use log::debug;

use crate::config::LensConfig;
use crate::error::{LensError, Result};

/// Byte stream to a lens driver. Dropping it closes the connection.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Transport for T {}

/// Opens the serial device at `path` with the configured baud rate and timeout.
pub fn open_serial(path: &str, config: &LensConfig) -> Result<Box<dyn Transport>> {
    debug!("Opening {} at {} baud", path, config.baud_rate);
    let port = serialport::new(path, config.baud_rate)
        .timeout(config.timeout)
        .open()
        .map_err(|source| LensError::Connection {
            path: path.to_string(),
            source,
        })?;
    Ok(Box::new(port))
}
