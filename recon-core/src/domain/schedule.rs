//! Schedule domain types
//!
//! A schedule entry couples a trigger with a job template. Entries change only
//! through explicit schedule management, never through the jobs they spawn.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::JobOptions;
use crate::domain::target::Scope;

/// A recurring or one-shot job trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    pub template: JobTemplate,
    pub paused: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// `None` once a one-shot entry has fired
    pub next_fire_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_fired_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_job_id: Option<Uuid>,
    pub fire_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Cron expression with a leading seconds field, e.g. `0 0 3 * * * *`
    Cron { expression: String },
    Interval { every_secs: u64 },
    Once { at: chrono::DateTime<chrono::Utc> },
}

/// Job request blueprint, resolved into a concrete request at fire time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub target: String,
    #[serde(default)]
    pub scope: Scope,
    pub tools: ToolSelection,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "names", rename_all = "snake_case")]
pub enum ToolSelection {
    Named(Vec<String>),
    /// Every enabled tool that needs no approval under the policy active at
    /// fire time
    AllEnabled,
}

fn default_creator() -> String {
    "scheduler".to_string()
}
