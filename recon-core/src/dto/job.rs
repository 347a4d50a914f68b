//! Job DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{Job, JobOptions, JobStatus};
use crate::domain::run::Run;
use crate::domain::target::{Scope, TargetType};

/// Request to run one or more tools against a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub target: String,
    #[serde(default)]
    pub scope: Scope,
    pub tools: Vec<String>,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

impl JobRequest {
    pub fn new(target: impl Into<String>, tools: &[&str]) -> Self {
        Self {
            target: target.into(),
            scope: Scope::Unknown,
            tools: tools.iter().map(|t| t.to_string()).collect(),
            options: JobOptions::default(),
            created_by: default_creator(),
        }
    }

    /// Tool names in request order with duplicates removed
    pub fn normalized_tools(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.tools
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty() && seen.insert(t.to_string()))
            .map(str::to_string)
            .collect()
    }
}

fn default_creator() -> String {
    "anonymous".to_string()
}

/// Point-in-time view of a job and its runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub target: String,
    pub target_type: TargetType,
    pub tools: Vec<String>,
    pub status: JobStatus,
    pub reason: Option<String>,
    pub policy_version: u64,
    pub created_by: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub options: JobOptions,
    pub runs: Vec<Run>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            target: job.target.value.clone(),
            target_type: job.target.target_type,
            tools: job.tools.clone(),
            status: job.status,
            reason: job.reason.clone(),
            policy_version: job.policy_version,
            created_by: job.created_by.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            options: job.options.clone(),
            runs: job.runs.clone(),
        }
    }
}

/// Filter for listing jobs; empty fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub target: Option<String>,
    pub created_by: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.target.as_ref().is_none_or(|t| *t == job.target.value)
            && self
                .created_by
                .as_ref()
                .is_none_or(|c| *c == job.created_by)
    }
}
