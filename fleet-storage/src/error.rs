//! Carve Storage Error Types

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Write operation failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Read operation failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Reassembly found missing or inconsistent blocks
    #[error("Integrity check failed: {0}")]
    IntegrityFailed(String),

    /// Backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Block reference not handled by this backend
    #[error("Unsupported block reference: {0}")]
    UnsupportedReference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation failed
    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;
