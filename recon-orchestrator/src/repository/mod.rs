//! Repository Module
//!
//! Persistence contract consumed by the orchestrator. Every write is an
//! idempotent upsert keyed by entity id, so a write retried after a partial
//! failure leaves the store in the same state as a single write.

mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::Finding;
use recon_core::domain::job::Job;
use recon_core::domain::run::Run;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Transient; the write may be retried
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting write: {0}")]
    Conflict(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Stores the job record; `runs` are persisted separately
    async fn upsert_job(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Loads a job with its runs attached
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RepositoryError>;

    async fn upsert_run(&self, run: &Run) -> Result<(), RepositoryError>;

    /// Evidence is write-once: storing identical evidence again is a no-op,
    /// different content under the same id is a conflict
    async fn put_evidence(&self, evidence: &Evidence) -> Result<(), RepositoryError>;

    async fn get_evidence(&self, id: Uuid) -> Result<Option<Evidence>, RepositoryError>;

    /// Replaces the findings recorded for a run
    async fn put_findings(&self, run_id: Uuid, findings: &[Finding])
    -> Result<(), RepositoryError>;

    async fn list_findings(&self, run_id: Uuid) -> Result<Vec<Finding>, RepositoryError>;
}

/// Exponential backoff applied at the persistence boundary
///
/// Independent of run retries: a storage outage never consumes a run
/// attempt.
#[derive(Debug, Clone, Copy)]
pub struct PersistRetry {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PersistRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl PersistRetry {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// Runs `op` until it succeeds, fails permanently or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let mut attempt = 0;
        let mut delay = self.initial_delay;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= self.attempts {
                        error!("Failed to {} after {} attempts: {}", what, attempt, e);
                        return Err(e);
                    }

                    warn!(
                        "Failed to {} (attempt {}/{}): {}",
                        what, attempt, self.attempts, e
                    );

                    tokio::time::sleep(delay).await;

                    // Exponential backoff with cap
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let retry = PersistRetry::with_attempts(5);

        let result = retry
            .run("store job", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RepositoryError::Unavailable("connection reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let retry = PersistRetry::with_attempts(3);

        let result: Result<(), _> = retry
            .run("store job", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepositoryError::Unavailable("down".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let calls = AtomicU32::new(0);
        let retry = PersistRetry::with_attempts(5);

        let result: Result<(), _> = retry
            .run("store evidence", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepositoryError::Conflict("evidence differs".into()))
            })
            .await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
