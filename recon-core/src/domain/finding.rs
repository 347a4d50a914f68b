//! Finding domain types
//!
//! Findings are normalized observations produced by tool adapters from
//! evidence. The engine stores them but does not interpret them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A normalized security observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub run_id: Uuid,
    pub evidence_id: Uuid,
    pub tool: String,
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}
