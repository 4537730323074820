use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Output ramp performed before the transport is released.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ramp {
    pub duration: Duration,
    pub steps: usize,
}

impl Default for Ramp {
    fn default() -> Self {
        Ramp {
            duration: Duration::from_secs(1),
            steps: 50,
        }
    }
}

/// Settings for opening a [`LensDriver`](crate::LensDriver) session.
#[derive(Clone, Debug, PartialEq)]
pub struct LensConfig {
    pub baud_rate: u32,
    /// Read timeout for each device reply.
    pub timeout: Duration,
    /// Initialize `env_logger` at debug level when the session opens.
    pub debug: bool,
    /// `None` releases the device without touching its output.
    pub close_ramp: Option<Ramp>,
}

impl Default for LensConfig {
    fn default() -> Self {
        LensConfig {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            debug: false,
            close_ramp: Some(Ramp::default()),
        }
    }
}

impl LensConfig {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_close_ramp(mut self, duration: Duration, steps: usize) -> Self {
        self.close_ramp = Some(Ramp { duration, steps });
        self
    }

    pub fn without_close_ramp(mut self) -> Self {
        self.close_ramp = None;
        self
    }
}
