//! Orchestrator error types

use thiserror::Error;
use uuid::Uuid;

use crate::repository::RepositoryError;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors returned by orchestrator and scheduler entry points
///
/// Policy violations and run failures are not errors here: they are recorded
/// on the job and its runs and surfaced through status queries.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Schedule {0} not found")]
    ScheduleNotFound(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::ScheduleNotFound(_))
    }
}
