use axum::{extract::State, Json};
use serde::Serialize;

use crate::websocket::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub registered: usize,
}

/// GET /health - liveness plus the number of registered participants
pub async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        registered: state.registered(),
    })
}
