use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pglua_core::ScriptError;
use serde_json::json;

/// Failures while loading the environment or the config script.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path} after waiting for {waited:?}: {reason}")]
    Unavailable {
        path: String,
        waited: Duration,
        reason: String,
    },

    #[error("configuration failed to run: {0}")]
    Script(#[from] ScriptError),

    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidRoute { pattern: String, reason: String },

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("{name} must be a valid {expected}, got {value:?}")]
    InvalidEnv {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Application-level error type for HTTP handlers.
///
/// Script failures never reach this type: the dispatcher answers them with a
/// bare 500 so the script's error text stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("No route matches {0}")]
    NotFound(String),

    #[error("Method {method} is not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            AppError::MethodNotAllowed { .. } => (
                StatusCode::METHOD_NOT_ALLOWED,
                "METHOD_NOT_ALLOWED",
                self.to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::PayloadTooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                self.to_string(),
            ),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
