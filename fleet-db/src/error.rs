//! Fleet database error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Blocking task failed: {0}")]
    Blocking(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Carve storage error: {0}")]
    Storage(#[from] fleet_storage::StorageError),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for fleet_core::CoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => fleet_core::CoreError::NotFound(what),
            DbError::AlreadyExists(what) => fleet_core::CoreError::AlreadyExists(what),
            DbError::Validation(msg) => fleet_core::CoreError::Validation(msg),
            DbError::InvalidState(msg) => fleet_core::CoreError::InvalidStateTransition(msg),
            other => fleet_core::CoreError::Storage(other.to_string()),
        }
    }
}
