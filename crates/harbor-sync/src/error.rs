//! Error types for discovery and sync operations

use crate::chain_index::ChainIndexError;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key material or derivation error
    #[error(transparent)]
    Core(#[from] harbor_core::Error),

    /// Cache storage error
    #[error("Storage error: {0}")]
    Storage(#[from] harbor_storage::Error),

    /// Chain index query failed
    #[error("Chain index error: {0}")]
    ChainIndex(#[from] ChainIndexError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Background task failed
    #[error("Task error: {0}")]
    Task(String),
}

impl Error {
    /// Whether the caller can fix this by supplying different key material
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::Core(e) if e.is_user_error())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}
