use thiserror::Error;

/// Failure of a single sensor poll. The whole measurement is discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("invalid {attribute} reading from power meter")]
    InvalidReading { attribute: &'static str },
}

/// Failure of a call against the remote store. Never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("write to {path} failed: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("read of {path} failed: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Opaque reason string as reported by the store
    pub fn reason(&self) -> &str {
        match self {
            RemoteError::WriteFailed { reason, .. } | RemoteError::ReadFailed { reason, .. } => {
                reason.as_str()
            }
            RemoteError::Unavailable(reason) => reason.as_str(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("network link disconnected: {0}")]
    Disconnected(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("relay index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("relay pin {index} could not be driven: {reason}")]
    Pin { index: usize, reason: String },
}
