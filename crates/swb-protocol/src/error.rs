//! Protocol error types

use thiserror::Error;

/// Wire-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
