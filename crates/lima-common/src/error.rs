//! Centralized error types for the bridge.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! variants that convert directly into provisioning API responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all lima crates.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // === Auth errors ===
    #[error("Missing Authorization header")]
    MissingAuthHeader,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Missing user_id query param")]
    MissingUserId,

    #[error("Missing keys")]
    MissingLoginKeys,

    #[error("LinkedIn authorization failed")]
    LinkedInAuthFailed,

    // === Resource errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Validation ===
    #[error("Malformed JSON")]
    MalformedBody,

    // === Infrastructure errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to provisioning clients.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl BridgeError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingAuthHeader | Self::MissingUserId | Self::MissingLoginKeys
            | Self::MalformedBody => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::FORBIDDEN,
            Self::LinkedInAuthFailed => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            BridgeError::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            BridgeError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse { error: message };
        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
