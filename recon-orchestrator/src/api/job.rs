//! Job API Handlers
//!
//! HTTP endpoints for job submission, status and cancellation.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use recon_core::domain::finding::Finding;
use recon_core::domain::job::JobStatus;
use recon_core::dto::job::{JobFilter, JobRequest, JobSnapshot};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

// =============================================================================
// Job Lifecycle Endpoints
// =============================================================================

/// POST /job
/// Submit a job; rejected jobs are returned with status `rejected`
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<JobSnapshot>)> {
    tracing::info!("Submitting job for target: {}", req.target);

    let id = state.orchestrator.submit(req).await?;
    let job = state.orchestrator.get_status(id).await?;

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /job/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobSnapshot>> {
    tracing::debug!("Getting job: {}", id);

    Ok(Json(state.orchestrator.get_status(id).await?))
}

/// GET /job/list
///
/// Query parameters:
/// - `status` (optional): Only jobs in this status
/// - `target` (optional): Only jobs against this target value
/// - `created_by` (optional): Only jobs submitted by this creator
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobSnapshot>>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let filter = JobFilter {
        status,
        target: params.target,
        created_by: params.created_by,
    };

    Ok(Json(state.orchestrator.list_jobs(&filter)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub target: Option<String>,
    pub created_by: Option<String>,
}

/// POST /job/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobSnapshot>> {
    tracing::info!("Cancelling job: {}", id);

    Ok(Json(state.orchestrator.cancel(id).await?))
}

// =============================================================================
// Results
// =============================================================================

/// GET /job/{id}/findings
pub async fn get_job_findings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Finding>>> {
    Ok(Json(state.orchestrator.findings(id).await?))
}
