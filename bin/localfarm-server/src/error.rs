//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON body `{"error": ..., "kind": ...}` with an appropriate status.
//!
//! **Security note:** provider and storage failures are logged with full
//! detail but only a generic message is returned to the caller, so upstream
//! error bodies, SQL or file paths never leak to clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use localfarm_relay::{PersistenceError, ProviderError, RelayError, ValidationError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can end a request before a stream is opened.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The chat request failed validation; nothing was persisted.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No user could be identified for the request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller sent an invalid query or path parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The completion provider failed before any fragment was produced.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The history store could not be reached.
    #[error("storage error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl ServerError {
    /// Stable machine-checkable identifier sent as `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Validation(e) => e.kind(),
            ServerError::Unauthorized(_) => "unauthorized",
            ServerError::BadRequest(_) => "bad_request",
            ServerError::Provider(_) => "provider_unavailable",
            ServerError::Persistence(_) => "storage_unavailable",
        }
    }
}

impl From<RelayError> for ServerError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Persistence(e) => ServerError::Persistence(e),
            RelayError::Provider(e) => ServerError::Provider(e),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            // Client-facing errors: expose the message directly.
            ServerError::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ServerError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),

            // Upstream errors: log the detail, answer generically.
            ServerError::Provider(e) => {
                error!(error = %e, "completion provider error");
                (
                    StatusCode::BAD_GATEWAY,
                    "the AI service is unavailable; please try again later".to_owned(),
                )
            }
            ServerError::Persistence(e) => {
                error!(error = %e, "history store error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "chat history is temporarily unavailable".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message, "kind": self.kind() }))).into_response()
    }
}
