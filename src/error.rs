//! Error taxonomy shared by every component and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("file is {size} bytes, exceeding the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("{0}")]
    Forbidden(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailure(String),

    #[error("command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Convert an I/O error raised while operating on `path`.
    pub fn io(path: impl std::fmt::Display, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AgentError::NotFound(format!("{path} not found")),
            io::ErrorKind::AlreadyExists => AgentError::Conflict(format!("{path} already exists")),
            _ => AgentError::Internal(format!("{path}: {err}")),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
            AgentError::InvalidPath(_) | AgentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Conflict(_) => StatusCode::CONFLICT,
            AgentError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AgentError::Forbidden(_) => StatusCode::FORBIDDEN,
            AgentError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AgentError::SpawnFailure(_) | AgentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Unauthorized => "UNAUTHORIZED",
            AgentError::InvalidPath(_) => "INVALID_PATH",
            AgentError::InvalidRequest(_) => "INVALID_REQUEST",
            AgentError::NotFound(_) => "NOT_FOUND",
            AgentError::Conflict(_) => "CONFLICT",
            AgentError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            AgentError::Forbidden(_) => "FORBIDDEN",
            AgentError::SpawnFailure(_) => "SPAWN_FAILURE",
            AgentError::Timeout(_) => "TIMEOUT",
            AgentError::Internal(_) => "INTERNAL",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
