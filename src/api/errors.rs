//! API error types and HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::runner::ScheduleError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Queueing is disabled for the pipeline and it is at capacity.
    QueueDisabled(String),
    /// The pipeline's wait list is full.
    QueueFull(String),
    /// Missing or invalid bearer token.
    Unauthorized(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::QueueDisabled(msg) => (StatusCode::CONFLICT, "no_queue", msg),
            ApiError::QueueFull(msg) => (StatusCode::TOO_MANY_REQUESTS, "queue_full", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::UnknownPipeline(_) => ApiError::NotFound(err.to_string()),
            ScheduleError::QueueDisabled(_) => ApiError::QueueDisabled(err.to_string()),
            ScheduleError::QueueFull(_) => ApiError::QueueFull(err.to_string()),
        }
    }
}
