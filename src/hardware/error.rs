//! Receiver communication error types and handling

use thiserror::Error;

/// Communication errors for the receiver channel
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommError {
    /// Port could not be opened
    #[error("cannot open receiver port {port}: {details}")]
    PortUnavailable { port: String, details: String },
    /// Channel closed by the peer or removed
    #[error("connection lost to receiver {channel}")]
    ConnectionLost { channel: String },
    /// Read or write fault on an open channel
    #[error("receiver I/O error during {operation}: {details}")]
    Io { operation: String, details: String },
    /// Invalid receiver configuration
    #[error("configuration error: invalid {parameter} = {value}")]
    ConfigurationError { parameter: String, value: String },
}

/// Result type for receiver channel operations
pub type CommResult<T> = Result<T, CommError>;

impl CommError {
    pub(crate) fn io(operation: &str, error: &std::io::Error) -> Self {
        CommError::Io {
            operation: operation.to_string(),
            details: error.to_string(),
        }
    }
}
