//! Schedule DTOs

use serde::{Deserialize, Serialize};

use crate::domain::schedule::{JobTemplate, Trigger};

/// Request to create a schedule entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSchedule {
    pub name: String,
    pub trigger: Trigger,
    pub template: JobTemplate,
    #[serde(default)]
    pub paused: bool,
}
