//! Circuit breaker snapshots.

use std::collections::BTreeMap;

use axum::{extract::State, Json};
use bastion_circuit::CircuitStats;

use crate::AppState;

/// `GET /circuits`: every breaker the manager has created, keyed by
/// dependency.
pub async fn list_circuits(State(state): State<AppState>) -> Json<BTreeMap<String, CircuitStats>> {
    Json(state.circuits.all_stats())
}
