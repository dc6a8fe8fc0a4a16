//! HTTP request handlers for the bastion operational API.
//!
//! Handlers are grouped by functionality:
//! - `health` - liveness, readiness and health probes
//! - `deliveries` - delivery attempt read-back
//! - `circuits` - circuit breaker snapshots
//!
//! Errors are returned as `{"error": {"code": ..., "message": ...}}` with a
//! matching HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub mod circuits;
pub mod deliveries;
pub mod health;

pub use circuits::list_circuits;
pub use deliveries::get_delivery;
pub use health::{health_check, liveness_check, readiness_check};

/// Standard error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code, e.g. `not_found`
    pub code: &'static str,
    /// Human-readable error description
    pub message: String,
}

/// Builds an error response with `status` and a JSON body.
pub fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    let body = ErrorResponse { error: ErrorDetail { code, message: message.into() } };
    (status, Json(body)).into_response()
}
