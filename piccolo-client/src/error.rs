use std::{io, path::PathBuf};

use piccolo_protocol::error::ProtocolError;

/// Errors raised to callers of the host-side clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
    #[error("Could not read calibration {}: {source}", .path.display())]
    CalibrationIo { path: PathBuf, source: io::Error },
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),
    #[error("No calibration for channel {0}")]
    MissingChannel(usize),
    #[error("Register {0} is neither an intensity, an area nor a width")]
    UnknownQuantity(String),
    #[error("Got {keys} threshold registers but {limits} limits")]
    LimitCountMismatch { keys: usize, limits: usize },
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::InvalidCalibration(value.to_string())
    }
}

impl ClientError {
    /// Whether the error is a socket timeout that a polling worker may outlive.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Io(err) => {
                matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            ClientError::Protocol(err) => err.is_timeout(),
            _ => false,
        }
    }
}
