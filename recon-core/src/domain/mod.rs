//! Core domain types
//!
//! This module contains the core domain structures used across Recon services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns their lifecycle) and the persistence and API layers.

pub mod evidence;
pub mod finding;
pub mod job;
pub mod policy;
pub mod run;
pub mod schedule;
pub mod target;
