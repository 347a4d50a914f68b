//! Service Module
//!
//! Business logic layer: the job orchestrator and the scheduler that feeds
//! it.

pub mod job;
pub mod schedule;

pub use job::{EngineSettings, Orchestrator, StatsSnapshot};
pub use schedule::{JobSubmitter, Scheduler};
