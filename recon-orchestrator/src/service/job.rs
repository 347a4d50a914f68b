//! Job Service
//!
//! The orchestrator owns every job from submission to its terminal state.
//! Submission validates the request against the active policy, creates one
//! run per requested tool and hands the accepted runs to the executor. Run
//! events come back through [`RunReporter`]; a per-job outstanding counter
//! triggers finalization exactly once when the last run settles.

use crate::adapter::AdapterRegistry;
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::executor::{Executor, ExecutorConfig, JobAbort, RetryNotice, RunReport, RunReporter, RunTask};
use crate::limiter::RateLimiter;
use crate::policy::{PolicyEngine, PolicyStore};
use crate::repository::{PersistRetry, Repository, RepositoryError};
use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::Finding;
use recon_core::domain::job::{Job, JobStatus};
use recon_core::domain::run::{FailureKind, Run, RunOutcome, RunStatus};
use recon_core::dto::job::{JobFilter, JobRequest, JobSnapshot};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Settings and statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub output_dir: PathBuf,
    pub persist: PersistRetry,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            output_dir: config.output_dir.clone(),
            persist: PersistRetry::with_attempts(config.persist_attempts),
        }
    }
}

/// Job counters, each bumped once per job
#[derive(Debug, Default)]
pub struct EngineStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    completed_with_errors: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub completed_with_errors: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl EngineStats {
    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_terminal(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Rejected => &self.rejected,
            JobStatus::Completed => &self.completed,
            JobStatus::CompletedWithErrors => &self.completed_with_errors,
            JobStatus::Failed => &self.failed,
            JobStatus::Cancelled => &self.cancelled,
            JobStatus::Pending | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            completed_with_errors: self.completed_with_errors.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Job book
// ============================================================================

struct JobEntry {
    job: Mutex<Job>,
    abort: JobAbort,
    cancel_requested: AtomicBool,
    /// Runs handed to the executor and not yet terminal
    outstanding: AtomicUsize,
    finalized: AtomicBool,
    status: watch::Sender<JobStatus>,
}

impl JobEntry {
    fn new(job: Job, outstanding: usize) -> Self {
        let finalized = job.status.is_terminal();
        let (status, _) = watch::channel(job.status);
        Self {
            job: Mutex::new(job),
            abort: JobAbort::new(),
            cancel_requested: AtomicBool::new(false),
            outstanding: AtomicUsize::new(outstanding),
            finalized: AtomicBool::new(finalized),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Job> {
        match self.job.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from(&*self.lock())
    }
}

/// Live jobs plus everything run events need; shared with the workers
struct JobBook {
    jobs: RwLock<HashMap<Uuid, Arc<JobEntry>>>,
    repository: Arc<dyn Repository>,
    persist: PersistRetry,
    stats: EngineStats,
}

impl JobBook {
    fn insert(&self, entry: Arc<JobEntry>) {
        let id = entry.lock().id;
        match self.jobs.write() {
            Ok(mut jobs) => jobs.insert(id, entry),
            Err(poisoned) => poisoned.into_inner().insert(id, entry),
        };
    }

    fn get(&self, id: Uuid) -> Option<Arc<JobEntry>> {
        match self.jobs.read() {
            Ok(jobs) => jobs.get(&id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&id).cloned(),
        }
    }

    fn entries(&self) -> Vec<Arc<JobEntry>> {
        match self.jobs.read() {
            Ok(jobs) => jobs.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    async fn store_job(&self, job: &Job) -> std::result::Result<(), RepositoryError> {
        self.persist
            .run("store job", || self.repository.upsert_job(job))
            .await
    }

    async fn store_run(&self, run: &Run) -> std::result::Result<(), RepositoryError> {
        self.persist
            .run("store run", || self.repository.upsert_run(run))
            .await
    }

    async fn store_run_logged(&self, run: &Run) {
        if let Err(e) = self.store_run(run).await {
            error!("Failed to persist run {} of job {}: {}", run.id, run.job_id, e);
        }
    }

    async fn store_evidence(&self, evidence: &Evidence) -> std::result::Result<(), RepositoryError> {
        self.persist
            .run("store evidence", || self.repository.put_evidence(evidence))
            .await
    }

    async fn store_findings(
        &self,
        run_id: Uuid,
        findings: &[Finding],
    ) -> std::result::Result<(), RepositoryError> {
        self.persist
            .run("store findings", || {
                self.repository.put_findings(run_id, findings)
            })
            .await
    }

    /// Cancels runs that were never attempted; returns how many changed
    async fn cancel_unstarted(&self, entry: &JobEntry, failure: FailureKind, reason: &str) -> usize {
        let cancelled: Vec<Run> = {
            let mut job = entry.lock();
            job.runs
                .iter_mut()
                .filter(|run| run.status == RunStatus::Queued && run.attempts == 0)
                .filter_map(|run| {
                    run.finish(RunOutcome::failed(RunStatus::Cancelled, failure, reason))
                        .then(|| run.clone())
                })
                .collect()
        };

        for run in &cancelled {
            self.store_run_logged(run).await;
        }
        cancelled.len()
    }

    /// Accounts for `settled` runs reaching a terminal state
    async fn settle(&self, entry: &JobEntry, settled: usize) {
        if settled == 0 {
            return;
        }
        let before = entry.outstanding.fetch_sub(settled, Ordering::AcqRel);
        if before == settled {
            self.finalize(entry).await;
        }
    }

    /// Computes and records the final job status; a no-op after the first
    /// call
    async fn finalize(&self, entry: &JobEntry) -> JobStatus {
        if entry.finalized.swap(true, Ordering::AcqRel) {
            return entry.lock().status;
        }

        let job = {
            let mut job = entry.lock();
            let cancelled = entry.cancel_requested.load(Ordering::Acquire);
            let (status, reason) = final_status(&job, cancelled);
            if job.transition(status) {
                job.reason = reason;
            }
            job.clone()
        };

        self.stats.record_terminal(job.status);
        info!(
            "Job {} finalized as {} ({} run(s))",
            job.id,
            job.status,
            job.runs.len()
        );

        if let Err(e) = self.store_job(&job).await {
            error!("Failed to persist final state of job {}: {}", job.id, e);
        }
        entry.status.send_replace(job.status);
        job.status
    }

    /// Aborts the rest of a fail-fast job after `failed_tool` failed
    async fn trip_fail_fast(&self, entry: &JobEntry, failed_tool: &str) {
        if !entry.abort.trigger(FailureKind::FailFast) {
            return;
        }
        let reason = format!("aborted after {} failed", failed_tool);
        let cancelled = self.cancel_unstarted(entry, FailureKind::FailFast, &reason).await;
        info!(
            "Fail-fast tripped by {}; {} queued run(s) cancelled",
            failed_tool, cancelled
        );
        self.settle(entry, cancelled).await;
    }
}

/// Final status of a job whose runs are all terminal
fn final_status(job: &Job, cancel_requested: bool) -> (JobStatus, Option<String>) {
    if cancel_requested {
        return (JobStatus::Cancelled, Some("cancelled by request".to_string()));
    }

    let total = job.runs.len();
    let unsuccessful: Vec<String> = job
        .runs
        .iter()
        .filter(|run| run.status != RunStatus::Succeeded)
        .map(|run| match &run.reason {
            Some(reason) => format!("{} {} ({})", run.tool, run.status, reason),
            None => format!("{} {}", run.tool, run.status),
        })
        .collect();

    if unsuccessful.is_empty() {
        return (JobStatus::Completed, None);
    }

    let details = unsuccessful.join("; ");
    if unsuccessful.len() == total {
        (
            JobStatus::Failed,
            Some(format!("no run succeeded: {}", details)),
        )
    } else if job.options.fail_fast {
        (JobStatus::Failed, Some(format!("fail_fast: {}", details)))
    } else {
        (
            JobStatus::CompletedWithErrors,
            Some(format!(
                "{} of {} run(s) did not succeed: {}",
                unsuccessful.len(),
                total,
                details
            )),
        )
    }
}

#[async_trait]
impl RunReporter for JobBook {
    async fn run_started(&self, job_id: Uuid, run_id: Uuid, command: String) -> bool {
        let Some(entry) = self.get(job_id) else {
            warn!("Run {} started for unknown job {}", run_id, job_id);
            return false;
        };

        let run = {
            let mut job = entry.lock();
            let Some(run) = job.run_mut(run_id) else {
                return false;
            };
            if !run.mark_running(command) {
                return false;
            }
            run.clone()
        };

        self.store_run_logged(&run).await;
        true
    }

    async fn run_retrying(&self, job_id: Uuid, run_id: Uuid, notice: RetryNotice) {
        let Some(entry) = self.get(job_id) else {
            return;
        };

        let run = {
            let mut job = entry.lock();
            let Some(run) = job.run_mut(run_id) else {
                return;
            };
            if !run.schedule_retry(
                notice.failure,
                notice.reason,
                notice.exit_code,
                notice.next_eligible_at,
            ) {
                return;
            }
            run.clone()
        };

        self.store_run_logged(&run).await;
    }

    async fn run_finished(&self, job_id: Uuid, run_id: Uuid, report: RunReport) {
        let Some(entry) = self.get(job_id) else {
            warn!("Run {} finished for unknown job {}", run_id, job_id);
            return;
        };

        // Evidence and findings are durable before the run turns terminal
        if let Some(evidence) = &report.evidence {
            if let Err(e) = self.store_evidence(evidence).await {
                error!("Failed to persist evidence {} of run {}: {}", evidence.id, run_id, e);
            }
            if let Err(e) = self.store_findings(run_id, &report.findings).await {
                error!("Failed to persist findings of run {}: {}", run_id, e);
            }
        }

        let status = report.outcome.status;
        let run = {
            let mut job = entry.lock();
            let Some(run) = job.run_mut(run_id) else {
                debug!("Ignoring report for unknown run {}", run_id);
                return;
            };
            if !run.finish(report.outcome) {
                debug!("Ignoring late report for run {}", run_id);
                return;
            }
            run.clone()
        };

        self.store_run_logged(&run).await;

        let failed = matches!(status, RunStatus::Failed | RunStatus::TimedOut);
        if failed && entry.lock().options.fail_fast {
            self.trip_fail_fast(&entry, &run.tool).await;
        }

        self.settle(&entry, 1).await;
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    book: Arc<JobBook>,
    executor: Executor,
    policies: Arc<PolicyStore>,
    engine: PolicyEngine,
}

impl Orchestrator {
    /// Builds the orchestrator and starts its executor workers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        settings: EngineSettings,
        policies: Arc<PolicyStore>,
        adapters: AdapterRegistry,
        repository: Arc<dyn Repository>,
    ) -> Self {
        let book = Arc::new(JobBook {
            jobs: RwLock::new(HashMap::new()),
            repository,
            persist: settings.persist,
            stats: EngineStats::default(),
        });

        let executor = Executor::start(
            ExecutorConfig {
                workers: settings.workers,
                output_dir: settings.output_dir,
            },
            Arc::new(adapters),
            RateLimiter::new(),
            Arc::clone(&book) as Arc<dyn RunReporter>,
        );

        Self {
            book,
            executor,
            policies,
            engine: PolicyEngine::new(),
        }
    }

    /// Validates and accepts (or rejects) a job request
    ///
    /// Returns the job id in both cases; a rejected job is terminal
    /// immediately. Only an unparseable target or a storage failure is an
    /// error.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        let policy = self.policies.current();
        let decision = self.engine.validate(&request, &policy);
        let Some(target) = decision.target.clone() else {
            return Err(OrchestratorError::InvalidRequest(decision.summary()));
        };

        let mut job = Job {
            id: Uuid::new_v4(),
            target,
            tools: request.normalized_tools(),
            options: request.options.clone(),
            status: JobStatus::Pending,
            reason: None,
            policy_version: policy.version,
            created_by: request.created_by.clone(),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            runs: Vec::new(),
        };

        for notice in &decision.notices {
            info!("Job {}: {}", job.id, notice.message);
        }

        if !decision.accepted {
            job.reason = Some(decision.summary());
            job.transition(JobStatus::Rejected);

            self.book.store_job(&job).await?;
            self.book.stats.record_submitted();
            self.book.stats.record_terminal(JobStatus::Rejected);

            info!(
                "Job {} rejected under policy v{}: {}",
                job.id,
                policy.version,
                job.reason.as_deref().unwrap_or_default()
            );

            let id = job.id;
            self.book.insert(Arc::new(JobEntry::new(job, 0)));
            return Ok(id);
        }

        if self.executor.is_shutting_down() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let allowed: HashSet<&str> = decision.allowed.iter().map(|t| t.name.as_str()).collect();
        for tool in &job.tools {
            let run = if allowed.contains(tool.as_str()) {
                Run::queued(job.id, tool)
            } else {
                let reason = decision
                    .tool_violations()
                    .find(|v| v.tool.as_deref() == Some(tool.as_str()))
                    .map(|v| v.message.clone())
                    .unwrap_or_else(|| "not permitted by policy".to_string());
                Run::skipped(job.id, tool, FailureKind::PolicyViolation, reason)
            };
            job.runs.push(run);
        }
        job.transition(JobStatus::Running);

        // Runs first: a stored job record always has its runs
        for run in &job.runs {
            self.book.store_run(run).await?;
        }
        self.book.store_job(&job).await?;
        self.book.stats.record_submitted();

        let queued: Vec<(Uuid, String)> = job
            .runs
            .iter()
            .filter(|run| run.status == RunStatus::Queued)
            .map(|run| (run.id, run.tool.clone()))
            .collect();

        info!(
            "Job {} accepted under policy v{}: {} run(s) queued, {} skipped",
            job.id,
            policy.version,
            queued.len(),
            job.runs.len() - queued.len()
        );

        let job_slots = job
            .options
            .max_parallel_tools
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        let id = job.id;
        let target = job.target.clone();
        let options = job.options.clone();
        let entry = Arc::new(JobEntry::new(job, queued.len()));
        self.book.insert(Arc::clone(&entry));

        for (run_id, tool) in queued {
            let task = RunTask {
                job_id: id,
                run_id,
                tool,
                target: target.clone(),
                policy: Arc::clone(&policy),
                options: options.clone(),
                abort: entry.abort.clone(),
                job_slots: job_slots.clone(),
                attempts: 0,
                last_evidence: None,
            };
            if let Err(e) = self.executor.enqueue(task) {
                error!("Failed to enqueue run {} of job {}: {}", run_id, id, e);
                self.book
                    .run_finished(
                        id,
                        run_id,
                        RunReport {
                            outcome: RunOutcome::cancelled("engine shutting down"),
                            evidence: None,
                            findings: Vec::new(),
                        },
                    )
                    .await;
            }
        }

        Ok(id)
    }

    /// Current state of a job, falling back to storage for jobs not held in
    /// memory
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobSnapshot> {
        if let Some(entry) = self.book.get(job_id) {
            return Ok(entry.snapshot());
        }

        let job = self
            .book
            .persist
            .run("load job", || self.book.repository.get_job(job_id))
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        Ok(JobSnapshot::from(&job))
    }

    /// Jobs matching `filter`, newest first
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .book
            .entries()
            .iter()
            .filter_map(|entry| {
                let job = entry.lock();
                filter.matches(&job).then(|| JobSnapshot::from(&*job))
            })
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Requests cooperative cancellation
    ///
    /// Runs that never started are cancelled at once; runs in flight finish
    /// their current attempt. The job settles to `cancelled` once every run
    /// is terminal.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let entry = self.entry(job_id)?;

        {
            let job = entry.lock();
            if entry.finalized.load(Ordering::Acquire) || job.status.is_terminal() {
                return Err(OrchestratorError::InvalidState(format!(
                    "Job {} is already {}",
                    job_id, job.status
                )));
            }
            entry.cancel_requested.store(true, Ordering::Release);
        }

        entry.abort.trigger(FailureKind::Cancelled);
        let cancelled = self
            .book
            .cancel_unstarted(&entry, FailureKind::Cancelled, "job cancelled")
            .await;

        info!(
            "Job {} cancellation requested; {} queued run(s) cancelled",
            job_id, cancelled
        );

        self.book.settle(&entry, cancelled).await;
        Ok(entry.snapshot())
    }

    /// Resolves once the job is terminal
    pub async fn wait(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let entry = self.entry(job_id)?;
        let mut status = entry.status.subscribe();
        status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| OrchestratorError::InvalidState("status channel closed".to_string()))?;
        Ok(entry.snapshot())
    }

    /// Finalizes a job whose runs are all terminal
    ///
    /// Idempotent: calling it on an already finalized job returns the
    /// recorded status without side effects.
    pub async fn finalize(&self, job_id: Uuid) -> Result<JobStatus> {
        let entry = self.entry(job_id)?;

        let pending = entry
            .lock()
            .runs
            .iter()
            .filter(|run| !run.status.is_terminal())
            .count();
        if pending > 0 && !entry.finalized.load(Ordering::Acquire) {
            return Err(OrchestratorError::InvalidState(format!(
                "Job {} still has {} run(s) in progress",
                job_id, pending
            )));
        }

        Ok(self.book.finalize(&entry).await)
    }

    /// Findings of every run of the job
    pub async fn findings(&self, job_id: Uuid) -> Result<Vec<Finding>> {
        let job = self.get_status(job_id).await?;

        let mut findings = Vec::new();
        for run in job.runs.iter().filter(|run| run.evidence_id.is_some()) {
            let stored = self
                .book
                .persist
                .run("load findings", || self.book.repository.list_findings(run.id))
                .await?;
            findings.extend(stored);
        }
        Ok(findings)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.book.stats.snapshot()
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn limiter(&self) -> &RateLimiter {
        self.executor.limiter()
    }

    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }

    fn entry(&self, job_id: Uuid) -> Result<Arc<JobEntry>> {
        self.book
            .get(job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }
}
