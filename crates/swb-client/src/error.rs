//! Error types for the client session

use swb_storage::StorageError;
use swb_transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("No previous target to connect to")]
    NoTarget,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Discovery error: {0}")]
    Discovery(String),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => ClientError::Io(e),
            other => ClientError::Discovery(other.to_string()),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
