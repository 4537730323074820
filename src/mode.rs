use std::fmt;
use std::str::FromStr;

use num_derive::FromPrimitive;

use crate::error::LensError;

/// Operating mode of the lens driver, numbered as the device reports it.
#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LensMode {
    Current = 1,
    Sinusoidal = 2,
    Triangular = 3,
    Rectangular = 4,
    FocalPower = 5,
    Analog = 6,
    /// Reported by the device, never accepted as a command.
    Position = 7,
}

impl LensMode {
    pub const ALL: [LensMode; 7] = [
        LensMode::Current,
        LensMode::Sinusoidal,
        LensMode::Triangular,
        LensMode::Rectangular,
        LensMode::FocalPower,
        LensMode::Analog,
        LensMode::Position,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LensMode::Current => "current",
            LensMode::Sinusoidal => "sinusoidal",
            LensMode::Triangular => "triangular",
            LensMode::Rectangular => "rectangular",
            LensMode::FocalPower => "focal_power",
            LensMode::Analog => "analog",
            LensMode::Position => "position",
        }
    }

    /// The `Mw?A` command that switches the device into this mode.
    pub(crate) fn switch_command(self) -> Option<&'static [u8]> {
        match self {
            LensMode::Current => Some(b"MwDA"),
            LensMode::Sinusoidal => Some(b"MwSA"),
            LensMode::Triangular => Some(b"MwTA"),
            LensMode::Rectangular => Some(b"MwQA"),
            LensMode::FocalPower => Some(b"MwCA"),
            LensMode::Analog => Some(b"MwAA"),
            LensMode::Position => None,
        }
    }
}

impl fmt::Display for LensMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LensMode {
    type Err = LensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(LensMode::Current),
            "sinusoidal" => Ok(LensMode::Sinusoidal),
            "triangular" => Ok(LensMode::Triangular),
            "rectangular" => Ok(LensMode::Rectangular),
            "focal_power" | "focal" => Ok(LensMode::FocalPower),
            "analog" => Ok(LensMode::Analog),
            "position" => Ok(LensMode::Position),
            _ => Err(LensError::InvalidMode(s.to_string())),
        }
    }
}

/// Focal power bounds in diopters. Always `min <= max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FocalPowerRange {
    pub min: f64,
    pub max: f64,
}

impl FocalPowerRange {
    /// Returns `None` when the bounds are inverted or not finite.
    pub fn new(min: f64, max: f64) -> Option<Self> {
        if min.is_finite() && max.is_finite() && min <= max {
            Some(FocalPowerRange { min, max })
        } else {
            None
        }
    }

    pub fn contains(&self, diopter: f64) -> bool {
        (self.min..=self.max).contains(&diopter)
    }
}

impl From<FocalPowerRange> for (f64, f64) {
    fn from(range: FocalPowerRange) -> Self {
        (range.min, range.max)
    }
}
