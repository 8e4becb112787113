//! Crate-wide error type.
//!
//! One enum at the root, following the call-routing crates this codebase is
//! built from: library errors convert in via `#[from]`, orchestration-level
//! failures get a string-payload variant and a constructor helper.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("realtime transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("identifier error: {0}")]
    Identifier(String),

    #[error("webhook signature error: {0}")]
    Signature(String),

    #[error("barrier error: {0}")]
    Barrier(String),

    #[error("accept handshake error: {0}")]
    Accept(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn identifier(msg: impl Into<String>) -> Self {
        Self::Identifier(msg.into())
    }

    pub fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }

    pub fn barrier(msg: impl Into<String>) -> Self {
        Self::Barrier(msg.into())
    }

    pub fn accept(msg: impl Into<String>) -> Self {
        Self::Accept(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::Database(_) | OrchestratorError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            OrchestratorError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Signature(_) => StatusCode::UNAUTHORIZED,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Identifier(_) | OrchestratorError::Barrier(_) => {
                StatusCode::CONFLICT
            }
            OrchestratorError::Accept(_) | OrchestratorError::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::Serde(_) | OrchestratorError::Io(_) | OrchestratorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}
