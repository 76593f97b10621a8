//! Daemon error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nettrace_common::ErrorResponse;
use thiserror::Error;

use crate::ip_matcher::IpMatcherError;

/// Errors raised while constructing or running a single probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unknown probe type '{0}'")]
    UnknownType(String),
    #[error("malformed options for probe '{probe}': {reason}")]
    MalformedOptions { probe: String, reason: String },
    #[error("invalid CIDR in probe options: {0}")]
    InvalidCidr(#[from] IpMatcherError),
    #[error("failed to start probe: {0}")]
    StartFailed(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by tracing-task construction and lifecycle.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("task '{0}' not found")]
    NotFound(String),
}

/// Errors surfaced across the HTTP API boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(id) => ApiError::NotFound(format!("Cannot find task with id '{id}'")),
            TaskError::Probe(probe_err) => ApiError::BadRequest(probe_err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
        };
        (status, axum::Json(ErrorResponse { message })).into_response()
    }
}
