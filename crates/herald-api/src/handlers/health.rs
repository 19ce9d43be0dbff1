//! Health check handlers for service monitoring.
//!
//! `/health` is a liveness probe that never touches the database. `/ready`
//! checks database connectivity and answers 503 while it is down, so that
//! orchestrators stop routing submissions to an instance that cannot store
//! them.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::{storage::Storage, Clock};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Service name reported by the probes.
pub const SERVICE_NAME: &str = "herald";

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    /// Always `ok`
    pub status: &'static str,
    /// When the probe was answered
    pub timestamp: DateTime<Utc>,
    /// Service name
    pub service: &'static str,
}

/// Readiness response structure.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// Overall service readiness
    pub status: ReadinessStatus,
    /// Timestamp when the check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component checks
    pub checks: ReadinessChecks,
    /// Service version information
    pub version: String,
}

/// Overall readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessStatus {
    /// Every dependency is reachable
    Ready,
    /// A dependency is down
    Unavailable,
}

/// Individual component check results.
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    /// Database connectivity
    pub database: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Readiness checks with an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks every dependency the API needs to accept work.
    pub async fn readiness(&self, storage: &Storage) -> ReadinessResponse {
        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();

        let (status, message) = match storage.health_check().await {
            Ok(()) => {
                debug!("database health check passed");
                (ComponentStatus::Up, None)
            },
            Err(e) => {
                error!(error = %e, "database health check failed");
                (ComponentStatus::Down, Some(format!("Database connection failed: {e}")))
            },
        };
        let elapsed = self.clock.now().saturating_duration_since(start_time);

        let overall = match status {
            ComponentStatus::Up => ReadinessStatus::Ready,
            ComponentStatus::Down => ReadinessStatus::Unavailable,
        };

        ReadinessResponse {
            status: overall,
            timestamp,
            checks: ReadinessChecks {
                database: ComponentHealth {
                    status,
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Liveness probe.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let response = LivenessResponse {
        status: "ok",
        timestamp: app_state.clock.now_utc(),
        service: SERVICE_NAME,
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness probe: 200 when the database answers, 503 otherwise.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    let service = HealthService::new(app_state.clock.clone());
    let response = service.readiness(&app_state.storage).await;

    let status_code = match response.status {
        ReadinessStatus::Ready => StatusCode::OK,
        ReadinessStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response)).into_response()
}
