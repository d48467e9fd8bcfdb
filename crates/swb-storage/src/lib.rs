//! Switchboard Storage Backends
//!
//! Small key/value state kept across controller restarts, such as the
//! service the controller last connected to:
//! - Memory (default): volatile, for tests and one-shot runs
//! - SQLite: persisted in a single file

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;

/// Key under which the controller remembers its last service
pub const LAST_SERVICE_KEY: &str = "last_service";

/// Key/value store trait
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Load a value
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),
}

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
