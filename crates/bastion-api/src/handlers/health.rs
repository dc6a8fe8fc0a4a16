//! Liveness, readiness and health probes.
//!
//! `/live` never touches a dependency. `/ready` folds every registered
//! [`ReadinessCheck`] into one status and answers 503 only when a component
//! cannot serve at all. `/health` reports the same checks per component,
//! along with probe timings and any open circuits.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bastion_circuit::CircuitState;
use bastion_core::Clock;
use bastion_session::{Readiness, ReadinessCheck};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks, keyed by component name
    pub checks: BTreeMap<String, ComponentHealth>,
    /// Dependencies whose circuit is currently open
    pub open_circuits: Vec<String>,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Serving, but at least one component runs on a fallback
    Degraded,
    /// At least one component cannot serve
    Unhealthy,
}

impl From<Readiness> for HealthStatus {
    fn from(readiness: Readiness) -> Self {
        match readiness {
            Readiness::Ready => Self::Healthy,
            Readiness::Degraded => Self::Degraded,
            Readiness::Unavailable => Self::Unhealthy,
        }
    }
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component readiness
    pub status: Readiness,
    /// Probe duration in milliseconds
    pub response_time_ms: u64,
}

/// Readiness probe body.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready`, `degraded` or `unavailable`
    pub status: Readiness,
}

async fn probe(
    check: &Arc<dyn ReadinessCheck>,
    clock: &Arc<dyn Clock>,
) -> (String, ComponentHealth) {
    let started = clock.now();
    let status = check.readiness().await;
    let elapsed = clock.now().saturating_duration_since(started);
    let response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    (check.name().to_string(), ComponentHealth { status, response_time_ms })
}

/// Runs every check concurrently.
async fn probe_all(state: &AppState) -> BTreeMap<String, ComponentHealth> {
    join_all(state.checks.iter().map(|check| probe(check, &state.clock)))
        .await
        .into_iter()
        .collect()
}

fn status_code(readiness: Readiness) -> StatusCode {
    if readiness.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Health check endpoint handler.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let checks = probe_all(&state).await;
    let overall = Readiness::combine(checks.values().map(|c| c.status));

    let open_circuits = state
        .circuits
        .all_stats()
        .into_iter()
        .filter(|(_, stats)| stats.state == CircuitState::Open)
        .map(|(key, _)| key)
        .collect();

    let response = HealthResponse {
        status: overall.into(),
        timestamp: state.clock.now_utc(),
        checks,
        open_circuits,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    debug!(status = ?response.status, "health check completed");
    (status_code(overall), Json(response)).into_response()
}

/// Readiness check endpoint.
///
/// `degraded` still answers 200 so the instance stays in rotation.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let checks = probe_all(&state).await;
    let status = Readiness::combine(checks.values().map(|c| c.status));

    debug!(status = status.as_str(), "readiness check completed");
    (status_code(status), Json(ReadinessResponse { status })).into_response()
}

/// Liveness check endpoint. Tests no dependency.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "bastion",
    });

    (StatusCode::OK, Json(response)).into_response()
}
