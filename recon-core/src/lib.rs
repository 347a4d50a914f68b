//! Recon Core
//!
//! Core types and abstractions for the Recon job orchestration engine.
//!
//! This crate contains:
//! - Domain types: Core business entities (Target, Job, Run, Evidence, Policy, etc.)
//! - DTOs: Data transfer objects for submitting jobs and reading their status

pub mod domain;
pub mod dto;
