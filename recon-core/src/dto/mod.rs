//! Data Transfer Objects
//!
//! This module contains DTOs used at the boundary of the engine: job requests
//! handed to the orchestrator and the snapshots it returns to callers.

pub mod job;
pub mod schedule;
