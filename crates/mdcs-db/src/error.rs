//! Error types for the store layer.

use mdcs_delta::{CodecError, FilterError};
use mdcs_merkle::{BroadcastError, DagError, NodeCodecError, SyncError};
use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Datastore failure: {0}")]
    Storage(String),

    #[error("DAG failure: {0}")]
    Dag(#[from] DagError),

    #[error("DAG sync failure: {0}")]
    Sync(#[from] SyncError),

    #[error("Broadcast failure: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Serialization error: {0}")]
    Codec(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Height overflow above {0}")]
    HeightOverflow(u64),

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Codec(err.to_string())
    }
}

impl From<CodecError> for DbError {
    fn from(err: CodecError) -> Self {
        DbError::Codec(err.to_string())
    }
}

impl From<NodeCodecError> for DbError {
    fn from(err: NodeCodecError) -> Self {
        DbError::Codec(err.to_string())
    }
}

impl From<sled::Error> for DbError {
    fn from(err: sled::Error) -> Self {
        DbError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        DbError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
