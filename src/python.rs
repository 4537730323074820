use log::error;
use pyo3::create_exception;
use pyo3::exceptions;
use pyo3::prelude::*;

use crate::driver::LensDriver as RustLensDriver;
use crate::error::{ErrorKind, LensError};
use crate::mode::LensMode;

create_exception!(lens_driver, LensConnectionError, exceptions::PyConnectionError);
create_exception!(lens_driver, LensCommunicationError, exceptions::PyIOError);
create_exception!(lens_driver, InvalidModeError, exceptions::PyValueError);
create_exception!(lens_driver, InvalidStateError, exceptions::PyRuntimeError);

pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_class::<PyLensDriver>()?;
    m.add("LensConnectionError", py.get_type_bound::<LensConnectionError>())?;
    m.add("LensCommunicationError", py.get_type_bound::<LensCommunicationError>())?;
    m.add("InvalidModeError", py.get_type_bound::<InvalidModeError>())?;
    m.add("InvalidStateError", py.get_type_bound::<InvalidStateError>())?;
    Ok(())
}

impl From<LensError> for PyErr {
    fn from(err: LensError) -> PyErr {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Connection => LensConnectionError::new_err(message),
            ErrorKind::Communication => LensCommunicationError::new_err(message),
            ErrorKind::InvalidMode => InvalidModeError::new_err(message),
            ErrorKind::InvalidState => InvalidStateError::new_err(message),
            ErrorKind::InvalidArgument => exceptions::PyValueError::new_err(message),
        }
    }
}

/// Lens driver session. Use it in a `with` block so the device is released
/// when the block exits.
#[pyclass]
pub struct PyLensDriver {
    inner: Option<RustLensDriver>,
}

impl PyLensDriver {
    fn inner(&mut self) -> PyResult<&mut RustLensDriver> {
        self.inner
            .as_mut()
            .ok_or_else(|| InvalidStateError::new_err("Lens session is closed"))
    }

    fn inner_ref(&self) -> PyResult<&RustLensDriver> {
        self.inner
            .as_ref()
            .ok_or_else(|| InvalidStateError::new_err("Lens session is closed"))
    }
}

#[pymethods]
impl PyLensDriver {
    #[new]
    #[pyo3(signature = (port_name, debug=false))]
    fn new(port_name: &str, debug: bool) -> PyResult<Self> {
        let inner = RustLensDriver::open(port_name, debug)?;
        Ok(PyLensDriver { inner: Some(inner) })
    }

    fn get_mode(&self) -> String {
        match self.inner.as_ref().and_then(|lens| lens.mode()) {
            Some(mode) => mode.to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Get the current temperature of the lens
    fn get_temperature(&mut self) -> PyResult<f64> {
        Ok(self.inner()?.get_temperature()?)
    }

    /// Set the operation mode of the lens
    ///
    /// Args:
    ///     mode (str): "current", "focal_power", "sinusoidal", "triangular",
    ///         "rectangular" or "analog"
    ///
    /// Returns:
    ///     Optional tuple of (min_fp, max_fp) when setting focal_power mode
    fn set_mode(&mut self, mode: &str) -> PyResult<Option<(f64, f64)>> {
        let lens_mode: LensMode = mode.parse()?;
        let range = self.inner()?.set_mode(lens_mode)?;
        Ok(range.map(Into::into))
    }

    /// Query the device for its active mode
    fn refresh_mode(&mut self) -> PyResult<String> {
        self.inner()?.refresh_mode()?;
        Ok(self.get_mode())
    }

    /// Get the current in mA
    fn get_current(&mut self) -> PyResult<f64> {
        Ok(self.inner()?.get_current()?)
    }

    /// Set the current in mA
    fn set_current(&mut self, current: f64) -> PyResult<()> {
        Ok(self.inner()?.set_current(current)?)
    }

    /// Get the focal power in diopters
    fn get_diopter(&mut self) -> PyResult<f64> {
        Ok(self.inner()?.get_diopter()?)
    }

    /// Set the focal power in diopters
    fn set_diopter(&mut self, diopter: f64) -> PyResult<()> {
        Ok(self.inner()?.set_diopter(diopter)?)
    }

    /// Get the focal power gain
    fn get_gain(&mut self) -> PyResult<f64> {
        Ok(self.inner()?.gain()?)
    }

    /// Set the focal power gain (0 to 5)
    ///
    /// Returns:
    ///     Optional tuple of (min_fp, max_fp) reported for the new gain
    fn set_gain(&mut self, gain: f64) -> PyResult<Option<(f64, f64)>> {
        let range = self.inner()?.set_gain(gain)?;
        Ok(range.map(Into::into))
    }

    /// Get the temperature limits as (lower, upper) in °C
    fn get_temperature_limits(&mut self) -> PyResult<(f64, f64)> {
        Ok(self.inner()?.temperature_limits()?)
    }

    /// Set the temperature limits and return the reachable (min_fp, max_fp)
    fn set_temperature_limits(&mut self, lower: f64, upper: f64) -> PyResult<(f64, f64)> {
        let range = self.inner()?.set_temperature_limits(lower, upper)?;
        Ok(range.into())
    }

    /// Ramp the lens setting to zero over a specified duration
    ///
    /// Args:
    ///     duration (float): Time in seconds over which to ramp
    ///     steps (int): Number of steps to use in the ramp
    fn ramp_to_zero(&mut self, duration: f64, steps: usize) -> PyResult<()> {
        Ok(self.inner()?.ramp_to_zero(duration, steps)?)
    }

    /// Ramp the output down and release the device. Safe to call twice.
    fn close(&mut self) -> PyResult<()> {
        match self.inner.take() {
            Some(lens) => Ok(lens.close()?),
            None => Ok(()),
        }
    }

    #[getter]
    fn firmware_type(&self) -> PyResult<String> {
        Ok(self.inner_ref()?.firmware_type().to_string())
    }

    #[getter]
    fn firmware_version(&self) -> PyResult<(u8, u8, u16, u16)> {
        Ok(self.inner_ref()?.firmware_version())
    }

    #[getter]
    fn max_output_current(&self) -> PyResult<f64> {
        Ok(self.inner_ref()?.max_output_current())
    }

    fn __repr__(&self) -> String {
        format!("PyLensDriver(mode={})", self.get_mode())
    }

    fn __str__(&self) -> String {
        self.__repr__()
    }

    fn __enter__(slf: PyRef<Self>) -> PyRef<Self> {
        slf
    }

    #[pyo3(signature = (exc_type=None, _exc_value=None, _traceback=None))]
    fn __exit__(
        &mut self,
        exc_type: Option<PyObject>,
        _exc_value: Option<PyObject>,
        _traceback: Option<PyObject>,
    ) -> PyResult<bool> {
        // Leave an exception raised inside the block in place.
        if exc_type.is_some() {
            if let Err(e) = self.close() {
                error!("Error during context manager exit: {}", e);
            }
            return Ok(false);
        }
        self.close()?;
        Ok(false)
    }
}
