//! Client for Optotune-style tunable lens drivers attached over a serial port.
//!
//! A [`LensDriver`] is an exclusive session on one device. It performs the
//! handshake when opened and releases the port exactly once, either through
//! [`LensDriver::close`] or when dropped.
//!
//! ```no_run
//! use lens_driver::{LensDriver, LensMode};
//!
//! let mut lens = LensDriver::open("/dev/optotune_ld", true)?;
//! println!("Temperature: {}°C", lens.get_temperature()?);
//! lens.set_mode(LensMode::Current)?;
//! lens.set_current(50.0)?;
//! if let Some(range) = lens.set_mode(LensMode::FocalPower)? {
//!     println!("Focal power range: {} to {}", range.min, range.max);
//! }
//! lens.close()?;
//! # Ok::<(), lens_driver::LensError>(())
//! ```

#[cfg(feature = "python")]
use pyo3::prelude::*;

mod config;
mod driver;
mod error;
mod mode;
pub mod protocol;
#[cfg(feature = "python")]
mod python;
pub mod sim;
mod transport;

pub use config::{LensConfig, Ramp, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
pub use driver::{CancelHandle, LensDriver};
pub use error::{ErrorKind, LensError, Result};
pub use mode::{FocalPowerRange, LensMode};
pub use transport::{open_serial, Transport};

/// Entry point for the Python module
#[cfg(feature = "python")]
#[pymodule]
fn lens_driver(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)
}
