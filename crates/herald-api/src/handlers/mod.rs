//! HTTP request handlers for the herald API.
//!
//! Handlers are grouped by functionality:
//! - `events` - task submission and inspection
//! - `health` - liveness and readiness probes
//!
//! # Error Handling
//!
//! Every error body is JSON. Validation failures list the offending fields
//! as `{"errors": [{"field", "message"}]}`; everything else carries a single
//! `{"error": "..."}` message. Storage failures are logged and reported as a
//! generic 500 so that database details never reach the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub mod events;
pub mod health;

pub use events::{create_event, get_event, list_events};
pub use health::{health_check, readiness_check};

/// Single-message error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error description
    pub error: String,
}

/// Validation error body.
#[derive(Debug, Serialize)]
pub struct ValidationErrorResponse {
    /// One entry per rejected field
    pub errors: Vec<FieldError>,
}

/// A rejected request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path of the field; empty when the whole body is rejected
    pub field: String,
    /// Why the field was rejected
    pub message: String,
}

impl FieldError {
    /// Creates a field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse { error: message.to_string() })).into_response()
}

pub(crate) fn validation_error(errors: Vec<FieldError>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ValidationErrorResponse { errors })).into_response()
}

pub(crate) fn internal_error() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Fallback for unmatched routes.
pub async fn route_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Route not found")
}
