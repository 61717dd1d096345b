use std::io;

/// Errors that may occur when reading a frame from a stream.
///
/// Every variant tears down the connection it occurred on. A clean end of stream is
/// not an error: readers return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("Malformed JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidFormat(String),
    #[error("Message too large! Maximum is {max}, but got {got}")]
    TooManyBytes { max: usize, got: usize },
}

impl ProtocolError {
    /// Whether the error is a socket timeout rather than a malformed frame.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::IoError(err)
                if err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock
        )
    }

    /// Whether the peer went away (reset, abort or broken pipe).
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProtocolError::IoError(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                )
        )
    }
}
