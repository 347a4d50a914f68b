//! API Module
//!
//! HTTP API endpoints for the recon orchestrator.

pub mod error;
pub mod health;
pub mod job;
pub mod policy;
pub mod schedule;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::service::{Orchestrator, Scheduler};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/job", post(job::submit_job))
        .route("/job/list", get(job::list_jobs))
        .route("/job/{id}", get(job::get_job))
        .route("/job/{id}/cancel", post(job::cancel_job))
        .route("/job/{id}/findings", get(job::get_job_findings))
        // Schedule endpoints
        .route("/schedule", post(schedule::create_schedule))
        .route("/schedule/list", get(schedule::list_schedules))
        .route(
            "/schedule/{id}",
            get(schedule::get_schedule).delete(schedule::delete_schedule),
        )
        .route("/schedule/{id}/pause", post(schedule::pause_schedule))
        .route("/schedule/{id}/resume", post(schedule::resume_schedule))
        // Policy endpoints
        .route("/policy", get(policy::get_policy))
        .route("/policy/reload", post(policy::reload_policy))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
