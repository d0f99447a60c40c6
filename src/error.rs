//! Error types for the intercom orchestrator

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Orchestrator error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine returned {status}: {body}")]
    Engine { status: u16, body: String },

    #[error("KV store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Push dispatch failed: {0}")]
    Push(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Transient I/O failure: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transient(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            _ => {
                // No stack traces or upstream bodies cross the API boundary.
                tracing::error!(error = %self, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
