//! Schedule API Handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use recon_core::domain::schedule::ScheduleEntry;
use recon_core::dto::schedule::CreateSchedule;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /schedule
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateSchedule>,
) -> ApiResult<(StatusCode, Json<ScheduleEntry>)> {
    tracing::info!("Creating schedule: {}", req.name);

    let entry = state.scheduler.add(req)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// GET /schedule/list
pub async fn list_schedules(State(state): State<AppState>) -> Json<Vec<ScheduleEntry>> {
    Json(state.scheduler.list())
}

/// GET /schedule/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleEntry>> {
    Ok(Json(state.scheduler.get(id)?))
}

/// DELETE /schedule/{id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting schedule: {}", id);

    state.scheduler.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /schedule/{id}/pause
pub async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleEntry>> {
    Ok(Json(state.scheduler.pause(id)?))
}

/// POST /schedule/{id}/resume
pub async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleEntry>> {
    Ok(Json(state.scheduler.resume(id)?))
}
