//! API Error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_db::DbError;
use fleet_ingest::SinkError;
use fleet_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Operator API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Carve storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::InternalError(_) | ApiError::Configuration(_) | ApiError::Sink(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            ApiError::Db(e) => match e {
                DbError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                DbError::AlreadyExists(_) => (StatusCode::CONFLICT, "CONFLICT"),
                DbError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                DbError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
                DbError::Storage(StorageError::IntegrityFailed(_)) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "CARVE_INCOMPLETE")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            },
            ApiError::Storage(StorageError::IntegrityFailed(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "CARVE_INCOMPLETE")
            }
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// Node protocol failures.
///
/// Answers carry no body: agents only look at the status code, and an
/// unknown tenant must not learn anything about the service.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProtocolError::UnknownEnvironment(_) | ProtocolError::UnknownEndpoint(_) => {
                tracing::debug!(error = %self, "Rejected protocol request");
                StatusCode::NOT_FOUND
            }
            ProtocolError::Malformed(_) => {
                tracing::warn!(error = %self, "Rejected protocol request");
                StatusCode::BAD_REQUEST
            }
            ProtocolError::Db(_) => {
                tracing::error!(error = %self, "Protocol request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        status.into_response()
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_status() {
        let response = ApiError::from(DbError::NotFound("query q1".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::from(DbError::InvalidState("protected".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response =
            ApiError::from(DbError::Storage(StorageError::IntegrityFailed("missing block 2".into())))
                .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_protocol_errors_have_no_detail() {
        let response = ProtocolError::UnknownEnvironment("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ProtocolError::Malformed("expected value".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
