//! Error types for the transport layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Server is already running")]
    AlreadyRunning,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
