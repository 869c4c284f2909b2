//! Core error type for the Baton engine.
//!
//! `ServerError` is used throughout the core domain (stores, engine, sweepers).
//! When the `axum` feature is enabled, it also implements `IntoResponse`
//! so it can be used directly as an axum handler error type.

use crate::workflow::output::OutputError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The unit is in the wrong state for the requested transition.
    #[error("{message}")]
    InvalidState {
        message: String,
        current_status: String,
    },

    /// The unit exists but cannot be claimed right now.
    #[error("{message}")]
    NotClaimable {
        message: String,
        current_status: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Maximum retries exceeded ({max_retries})")]
    RetriesExhausted { max_retries: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_state(message: impl Into<String>, current_status: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
            current_status: current_status.into(),
        }
    }

    pub fn not_claimable(message: impl Into<String>, current_status: impl Into<String>) -> Self {
        Self::NotClaimable {
            message: message.into(),
            current_status: current_status.into(),
        }
    }
}

impl From<rusqlite::Error> for ServerError {
    fn from(err: rusqlite::Error) -> Self {
        ServerError::Database(err.to_string())
    }
}

impl From<OutputError> for ServerError {
    fn from(err: OutputError) -> Self {
        ServerError::MalformedPayload(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            ServerError::Database(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_)
            | ServerError::InvalidState { .. }
            | ServerError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            ServerError::NotClaimable { .. }
            | ServerError::Conflict(_)
            | ServerError::RetriesExhausted { .. } => StatusCode::CONFLICT,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
        };

        let body = match &self {
            ServerError::InvalidState {
                message,
                current_status,
            }
            | ServerError::NotClaimable {
                message,
                current_status,
            } => serde_json::json!({ "error": message, "currentStatus": current_status }),
            other => serde_json::json!({ "error": other.to_string() }),
        };
        (status, axum::Json(body)).into_response()
    }
}
