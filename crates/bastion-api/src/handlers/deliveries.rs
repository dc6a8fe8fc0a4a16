//! Delivery attempt read-back.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bastion_core::DeliveryAttemptId;
use tracing::{error, instrument};

use super::error_response;
use crate::AppState;

/// `GET /deliveries/{id}`: the delivery attempt record, including its
/// status, attempt counter and the last response or error.
#[instrument(name = "get_delivery", skip(state))]
pub async fn get_delivery(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<DeliveryAttemptId>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_id", "delivery id must be a UUID");
    };

    match state.deliveries.find_attempt(id).await {
        Ok(Some(attempt)) => (StatusCode::OK, Json(attempt)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("delivery {id} not found"),
        ),
        Err(err) => {
            error!(delivery_id = %id, error = %err, "delivery lookup failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "delivery storage is unavailable",
            )
        },
    }
}
