//! Error types for the AegisMesh scanner.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid or revoked agent token")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// HTTP status code this error maps to at the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::Validation(_) => StatusCode::BAD_REQUEST,
            MeshError::Unauthorized => StatusCode::UNAUTHORIZED,
            MeshError::Forbidden(_) => StatusCode::FORBIDDEN,
            MeshError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            MeshError::Integrity(_)
            | MeshError::Store(_)
            | MeshError::External(_)
            | MeshError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sled::Error> for MeshError {
    fn from(err: sled::Error) -> Self {
        MeshError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Store(format!("serialization: {err}"))
    }
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {}", self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
