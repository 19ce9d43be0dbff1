//! Task submission and inspection.
//!
//! `POST /events` validates the request and persists a pending task; the
//! dispatcher picks it up on its next cycle. `GET /events` and
//! `GET /events/{id}` read task state back.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use herald_core::{DeliveryTask, TaskFilter, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{error_response, internal_error, validation_error, FieldError};
use crate::AppState;

/// Longest accepted target URL, matching the column width.
pub const MAX_TARGET_URL_LENGTH: usize = 2048;

/// Page size used when none, zero, or garbage is requested.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size a client may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Response to an accepted submission.
#[derive(Debug, Serialize)]
pub struct CreateEventResponse {
    /// Identifier of the new task; also its `event_id`
    pub id: TaskId,
    /// Always `pending` for a new task
    pub status: TaskStatus,
    /// Fixed acknowledgement text
    pub message: String,
}

/// Query string of `GET /events`.
///
/// Numbers are taken as strings so that unparsable values fall back to
/// defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    /// Only return tasks in this state
    pub status: Option<String>,
    /// 1-based page number
    pub page: Option<String>,
    /// Page size
    pub limit: Option<String>,
}

/// One page of tasks.
#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    /// Tasks on this page, newest first
    pub data: Vec<DeliveryTask>,
    /// Number of tasks matching the filter
    pub total: i64,
    /// Page actually served
    pub page: u32,
    /// Page size actually used
    pub limit: u32,
}

/// A validated submission.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Absolute http(s) destination
    pub target_url: String,
    /// Payload object to deliver
    pub payload: Map<String, Value>,
}

/// Accepts a webhook for delivery.
///
/// Returns 202 with the new task id, or 400 listing every invalid field.
/// Malformed JSON is reported against the empty field name.
#[instrument(name = "create_event", skip(state, body))]
pub async fn create_event(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "rejected malformed request body");
            return validation_error(vec![FieldError::new("", rejection.body_text())]);
        },
    };

    let event = match validate_new_event(body) {
        Ok(event) => event,
        Err(errors) => {
            debug!(error_count = errors.len(), "rejected invalid submission");
            return validation_error(errors);
        },
    };

    match state.storage.tasks.create(&event.target_url, event.payload).await {
        Ok(task) => {
            info!(task_id = %task.id, target_url = %task.target_url, "delivery task accepted");
            (
                StatusCode::ACCEPTED,
                Json(CreateEventResponse {
                    id: task.id,
                    status: task.status,
                    message: "Event accepted for processing".to_string(),
                }),
            )
                .into_response()
        },
        Err(e) => {
            error!(error = %e, "failed to persist delivery task");
            internal_error()
        },
    }
}

/// Returns one task by id.
///
/// An id that is not a UUID cannot name a task and is reported as not found.
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return event_not_found();
    };

    match state.storage.tasks.find_by_id(TaskId(uuid)).await {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        Ok(None) => event_not_found(),
        Err(e) => {
            error!(task_id = %uuid, error = %e, "failed to load delivery task");
            internal_error()
        },
    }
}

/// Lists tasks newest first, optionally filtered by status.
#[instrument(name = "list_events", skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Response {
    let filter = match parse_status_filter(query.status.as_deref()) {
        Ok(filter) => filter,
        Err(error) => return validation_error(vec![error]),
    };
    let page = parse_page(query.page.as_deref());
    let limit = parse_limit(query.limit.as_deref());

    match state.storage.tasks.find_all(&filter, page, limit).await {
        Ok((data, total)) => {
            (StatusCode::OK, Json(ListEventsResponse { data, total, page, limit })).into_response()
        },
        Err(e) => {
            error!(error = %e, "failed to list delivery tasks");
            internal_error()
        },
    }
}

fn event_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Event not found")
}

/// Validates a submission body, collecting every field error.
///
/// # Errors
///
/// Returns one `FieldError` per invalid or missing field.
pub fn validate_new_event(body: Value) -> Result<NewEvent, Vec<FieldError>> {
    let Value::Object(mut body) = body else {
        return Err(vec![FieldError::new("", format!("Expected object, received {}", kind(&body)))]);
    };

    let mut errors = Vec::new();

    let target_url = match body.remove("target_url") {
        None | Some(Value::Null) => {
            errors.push(FieldError::new("target_url", "Required"));
            None
        },
        Some(Value::String(url)) => match validate_target_url(&url) {
            Ok(()) => Some(url),
            Err(message) => {
                errors.push(FieldError::new("target_url", message));
                None
            },
        },
        Some(other) => {
            errors.push(FieldError::new(
                "target_url",
                format!("Expected string, received {}", kind(&other)),
            ));
            None
        },
    };

    let payload = match body.remove("payload") {
        None | Some(Value::Null) => {
            errors.push(FieldError::new("payload", "Required"));
            None
        },
        Some(Value::Object(payload)) => Some(payload),
        Some(other) => {
            errors.push(FieldError::new(
                "payload",
                format!("Expected object, received {}", kind(&other)),
            ));
            None
        },
    };

    match (target_url, payload) {
        (Some(target_url), Some(payload)) if errors.is_empty() => {
            Ok(NewEvent { target_url, payload })
        },
        _ => Err(errors),
    }
}

fn validate_target_url(url: &str) -> Result<(), &'static str> {
    if url.chars().count() > MAX_TARGET_URL_LENGTH {
        return Err("URL must be at most 2048 characters");
    }

    let uri: Uri = url.parse().map_err(|_| "Invalid url")?;
    let scheme_ok = matches!(uri.scheme_str(), Some("http" | "https"));
    let host_ok = uri.host().is_some_and(|host| !host.is_empty());

    if scheme_ok && host_ok {
        Ok(())
    } else {
        Err("Invalid url")
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_status_filter(status: Option<&str>) -> Result<TaskFilter, FieldError> {
    match status.filter(|s| !s.is_empty()) {
        None => Ok(TaskFilter::all()),
        Some(raw) => raw.parse::<TaskStatus>().map(TaskFilter::with_status).map_err(|_| {
            FieldError::new(
                "status",
                format!("Invalid status '{raw}', expected one of: pending, succeeded, dead"),
            )
        }),
    }
}

/// Page number: at least 1, defaulting to 1.
fn parse_page(page: Option<&str>) -> u32 {
    page.and_then(|p| p.trim().parse::<i64>().ok())
        .filter(|p| *p != 0)
        .map_or(1, |p| u32::try_from(p.max(1)).unwrap_or(u32::MAX))
}

/// Page size: zero or garbage means the default, then clamped to
/// `1..=MAX_PAGE_SIZE`.
fn parse_limit(limit: Option<&str>) -> u32 {
    limit
        .and_then(|l| l.trim().parse::<i64>().ok())
        .filter(|l| *l != 0)
        .map_or(DEFAULT_PAGE_SIZE, |l| {
            u32::try_from(l.clamp(1, i64::from(MAX_PAGE_SIZE))).unwrap_or(DEFAULT_PAGE_SIZE)
        })
}
