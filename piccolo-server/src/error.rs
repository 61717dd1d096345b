use std::{io, path::PathBuf};

use piccolo_protocol::error::ProtocolError;

/// A register catalog could not be compiled. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read register catalog {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Malformed register catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported data type {tag} for register {name}")]
    UnsupportedType { name: String, tag: String },
    #[error("Register {0} is declared more than once")]
    DuplicateName(String),
    #[error("Invalid address {addr} for register {name}")]
    InvalidAddress { name: String, addr: String },
    #[error("Register {name} declares {addresses} addresses but {defaults} defaults")]
    DefaultCountMismatch {
        name: String,
        addresses: usize,
        defaults: usize,
    },
    #[error("Invalid default for register {name}: {source}")]
    InvalidDefault { name: String, source: RegisterError },
    #[error("Register {name} at 0x{address:x} lies outside the mapped region of {size} bytes")]
    OutOfRange {
        name: String,
        address: usize,
        size: usize,
    },
}

/// A single register access failed. Reported to the caller of that access only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("Register {0} not found in the register catalog")]
    UnknownName(String),
    #[error("Value {0:?} is not a binary literal")]
    InvalidBits(String),
    #[error("Expected an integer value, got {0:?}")]
    ExpectedInteger(String),
}

/// Errors that terminate a single connection or the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Register(#[from] RegisterError),
    #[error("{0}")]
    Config(#[from] ConfigError),
}
