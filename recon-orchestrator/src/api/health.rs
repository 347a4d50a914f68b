//! Health Check API Handler

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;
use crate::service::StatsSnapshot;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub policy_version: u64,
    pub jobs: StatsSnapshot,
    pub runs_in_flight: usize,
}

/// GET /health
/// Liveness plus engine counters
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        policy_version: state.orchestrator.policies().current().version,
        jobs: state.orchestrator.stats(),
        runs_in_flight: state.orchestrator.limiter().global_in_flight(),
    })
}
