//! Recon Orchestrator
//!
//! Policy-gated job engine for reconnaissance tooling: validates job requests
//! against the Rules of Engagement, fans them out into tool runs, executes
//! the runs under rate limits with retries, and keeps evidence and findings.

pub mod adapter;
pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod policy;
pub mod repository;
pub mod service;

#[cfg(test)]
mod testing;
