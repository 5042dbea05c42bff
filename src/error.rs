//! Error taxonomy for the coordinator and the workers.
//!
//! [`ServiceError`] is what API handlers return; it renders as the
//! `{success: false, error}` envelope with the matching HTTP status.
//! [`ErrorKind`] classifies terminal worker failures stored in the broker.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or incomplete request.
    #[error("{0}")]
    Validation(String),

    /// A referenced file does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Request body exceeds the configured limit.
    #[error("File too large. Maximum size is {limit_mb}MB.")]
    PayloadTooLarge { limit_mb: u64 },

    /// Anything unexpected, including broker failures.
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn payload_too_large(limit_bytes: usize) -> Self {
        Self::PayloadTooLarge {
            limit_mb: (limit_bytes / (1024 * 1024)) as u64,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", e))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(status = %status, error = %self, "Server error in API handler");
        }

        let body = json!({
            "success": false,
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

/// Classification of a terminal task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input vanished between submission and pickup.
    NotFound,
    /// Filesystem failure preparing the output location.
    Io,
    /// The conversion capability reported failure.
    Conversion,
    /// Soft or hard time limit exceeded.
    TimeLimit,
    /// Cancelled by a revoke request.
    Revoked,
    /// Unexpected fault (crash, panic, broken child process).
    Internal,
}
