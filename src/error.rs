use thiserror::Error;

use crate::mode::LensMode;

#[derive(Error, Debug)]
pub enum LensError {
    #[error("Could not open {path}: {source}")]
    Connection {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Handshake failed: unexpected reply {0:?}")]
    HandshakeFailed(Vec<u8>),

    #[error("Handshake failed: device did not answer: {0}")]
    HandshakeIo(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CRC check failed")]
    CrcError,

    #[error("Malformed response to {command}: {reason}")]
    MalformedResponse {
        command: String,
        reason: &'static str,
    },

    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Wrong operation mode: expected {expected}, got {actual:?}")]
    WrongMode {
        expected: LensMode,
        actual: Option<LensMode>,
    },

    #[error("{what} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Session cancelled")]
    Cancelled,
}

/// Coarse classification of [`LensError`], one class per caller reaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device could not be reached when the session was opened.
    Connection,
    /// Transport failure or malformed reply during an operation.
    Communication,
    /// Mode name not recognized, or mode cannot be commanded.
    InvalidMode,
    /// Operation not valid for the session's current state.
    InvalidState,
    /// Argument outside the range the device accepts.
    InvalidArgument,
}

impl LensError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LensError::Connection { .. }
            | LensError::HandshakeFailed(_)
            | LensError::HandshakeIo(_) => ErrorKind::Connection,
            LensError::Io(_) | LensError::CrcError | LensError::MalformedResponse { .. } => {
                ErrorKind::Communication
            }
            LensError::InvalidMode(_) => ErrorKind::InvalidMode,
            LensError::WrongMode { .. } | LensError::Cancelled => ErrorKind::InvalidState,
            LensError::OutOfRange { .. } => ErrorKind::InvalidArgument,
        }
    }

    pub(crate) fn malformed(command: &[u8], reason: &'static str) -> Self {
        LensError::MalformedResponse {
            command: String::from_utf8_lossy(command).into_owned(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, LensError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_error_classes() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply");
        assert_eq!(LensError::Io(timeout).kind(), ErrorKind::Communication);
        assert_eq!(LensError::CrcError.kind(), ErrorKind::Communication);
        assert_eq!(LensError::HandshakeFailed(b"Nope".to_vec()).kind(), ErrorKind::Connection);
        assert_eq!(LensError::InvalidMode("spin".into()).kind(), ErrorKind::InvalidMode);
        assert_eq!(LensError::Cancelled.kind(), ErrorKind::InvalidState);
        let wrong = LensError::WrongMode {
            expected: LensMode::Current,
            actual: None,
        };
        assert_eq!(wrong.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn wrong_mode_message_names_both_modes() {
        let err = LensError::WrongMode {
            expected: LensMode::Current,
            actual: Some(LensMode::FocalPower),
        };
        assert_eq!(
            err.to_string(),
            "Wrong operation mode: expected current, got Some(FocalPower)"
        );
    }

    #[test]
    fn malformed_keeps_printable_command() {
        let err = LensError::malformed(b"TCA", "short reply");
        assert_eq!(err.to_string(), "Malformed response to TCA: short reply");
    }
}
