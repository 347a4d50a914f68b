//! In-memory repository
//!
//! Default storage backend. Tables are plain maps behind a lock; nothing
//! survives a restart.

use super::{Repository, RepositoryError};
use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::Finding;
use recon_core::domain::job::Job;
use recon_core::domain::run::Run;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    runs: HashMap<Uuid, Run>,
    /// Run ids per job in insertion order
    job_runs: HashMap<Uuid, Vec<Uuid>>,
    evidence: HashMap<Uuid, Evidence>,
    findings: HashMap<Uuid, Vec<Finding>>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
    outage: AtomicU32,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `calls` operations fail with `Unavailable`
    pub fn simulate_outage(&self, calls: u32) {
        self.outage.store(calls, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn evidence_count(&self) -> usize {
        self.read().evidence.len()
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        let pending = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(RepositoryError::Unavailable(
                "simulated storage outage".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn upsert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut record = job.clone();
        record.runs.clear();
        self.write().jobs.insert(job.id, record);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        self.check_available()?;
        let tables = self.read();
        Ok(tables.jobs.get(&id).map(|job| {
            let mut job = job.clone();
            job.runs = tables
                .job_runs
                .get(&id)
                .into_iter()
                .flatten()
                .filter_map(|run_id| tables.runs.get(run_id).cloned())
                .collect();
            job
        }))
    }

    async fn upsert_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut tables = self.write();
        if tables.runs.insert(run.id, run.clone()).is_none() {
            tables.job_runs.entry(run.job_id).or_default().push(run.id);
        }
        Ok(())
    }

    async fn put_evidence(&self, evidence: &Evidence) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut tables = self.write();
        match tables.evidence.get(&evidence.id) {
            Some(existing) if existing == evidence => Ok(()),
            Some(_) => Err(RepositoryError::Conflict(format!(
                "evidence {} already stored with different content",
                evidence.id
            ))),
            None => {
                tables.evidence.insert(evidence.id, evidence.clone());
                Ok(())
            }
        }
    }

    async fn get_evidence(&self, id: Uuid) -> Result<Option<Evidence>, RepositoryError> {
        self.check_available()?;
        Ok(self.read().evidence.get(&id).cloned())
    }

    async fn put_findings(
        &self,
        run_id: Uuid,
        findings: &[Finding],
    ) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.write().findings.insert(run_id, findings.to_vec());
        Ok(())
    }

    async fn list_findings(&self, run_id: Uuid) -> Result<Vec<Finding>, RepositoryError> {
        self.check_available()?;
        Ok(self
            .read()
            .findings
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
