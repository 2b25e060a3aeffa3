//! Error types for the deployment manager

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dt_common::errors::CommonError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors of the storage contract
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} already exists")]
    Conflict(String),

    #[error("{0} is not found")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Main error type for the deployment manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("{0} is not found")]
    NotFound(String),

    #[error("Dispatch error: {0}")]
    DispatchError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ManagerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ManagerError::ValidationError(_)
            | ManagerError::JsonError(_)
            | ManagerError::Common(CommonError::ValidationError(_))
            | ManagerError::Common(CommonError::ArchiveError(_)) => StatusCode::BAD_REQUEST,
            ManagerError::NotFound(_) | ManagerError::Storage(StorageError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ManagerError::Storage(StorageError::Conflict(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ManagerError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ManagerError::from(StorageError::Conflict("order o1".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ManagerError::NotFound("target a1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ManagerError::DispatchError("closed".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
