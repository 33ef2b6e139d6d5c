//! Ingest and sink error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("HTTP sink error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] fleet_storage::StorageError),

    #[error("Database error: {0}")]
    Db(#[from] fleet_db::DbError),

    #[error("Sink timed out after {0} ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type SinkResult<T> = Result<T, SinkError>;
