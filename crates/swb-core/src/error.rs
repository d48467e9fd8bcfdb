//! Error types for Switchboard Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol unavailable: {0}")]
    ProtocolUnavailable(String),

    #[error("Unknown protocol selector: {0}")]
    UnknownSelector(String),

    #[error("Invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for Switchboard Core operations
pub type Result<T> = std::result::Result<T, Error>;
