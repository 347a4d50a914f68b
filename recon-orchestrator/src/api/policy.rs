//! Policy API Handlers
//!
//! Read the active policy and trigger a reload from its source file.

use axum::{Json, extract::State};
use recon_core::domain::policy::Policy;
use serde::Serialize;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /policy
pub async fn get_policy(State(state): State<AppState>) -> Json<Policy> {
    Json(state.orchestrator.policies().current().as_ref().clone())
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub version: u64,
    pub previous_version: u64,
}

/// POST /policy/reload
/// Re-reads the policy file; running jobs keep their original version
pub async fn reload_policy(State(state): State<AppState>) -> ApiResult<Json<ReloadResponse>> {
    let policies = state.orchestrator.policies();
    let previous_version = policies.current().version;
    let active = policies.reload()?;

    tracing::info!(
        "Policy reloaded: v{} -> v{}",
        previous_version,
        active.version
    );

    Ok(Json(ReloadResponse {
        version: active.version,
        previous_version,
    }))
}
