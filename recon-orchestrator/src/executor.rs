//! Executor
//!
//! A fixed pool of workers pulling runs from a shared FIFO queue. For each
//! attempt a worker resolves the adapter, waits for a rate limiter permit,
//! builds and runs the command under the tool's timeout and reports the
//! result. Failed attempts are re-queued at their next eligible time instead
//! of being retried in place, so a worker is never blocked by a backoff.

use crate::adapter::{self, AdapterRegistry, CommandOptions, ExecutionContext, ExecutionOutput};
use crate::error::{OrchestratorError, Result};
use crate::limiter::RateLimiter;
use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::Finding;
use recon_core::domain::job::JobOptions;
use recon_core::domain::policy::Policy;
use recon_core::domain::run::{FailureKind, RunOutcome, RunStatus};
use recon_core::domain::target::Target;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Job abort signal
// ============================================================================

/// Cancellation shared by every run of a job
///
/// The first trigger fixes the reason reported by runs that never start.
#[derive(Debug, Clone, Default)]
pub struct JobAbort {
    token: CancellationToken,
    reason: Arc<OnceLock<FailureKind>>,
}

impl JobAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call was the one that aborted the job
    pub fn trigger(&self, reason: FailureKind) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<FailureKind> {
        self.reason.get().copied()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

// ============================================================================
// Tasks and reports
// ============================================================================

/// One queued attempt of a run
#[derive(Debug, Clone)]
pub struct RunTask {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub tool: String,
    pub target: Target,
    /// Policy the job was accepted under
    pub policy: Arc<Policy>,
    pub options: JobOptions,
    pub abort: JobAbort,
    /// Per-job parallelism ceiling, when the job asked for one
    pub job_slots: Option<Arc<Semaphore>>,
    /// Attempts already made
    pub attempts: u32,
    /// Evidence of the most recent attempt, kept until the run is terminal
    pub last_evidence: Option<Evidence>,
}

#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub failure: FailureKind,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub next_eligible_at: chrono::DateTime<chrono::Utc>,
}

/// Terminal report of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub evidence: Option<Evidence>,
    pub findings: Vec<Finding>,
}

/// Receives run lifecycle events from the workers
#[async_trait]
pub trait RunReporter: Send + Sync {
    /// Called right before an attempt executes; `false` means the run may no
    /// longer start and the attempt is dropped
    async fn run_started(&self, job_id: Uuid, run_id: Uuid, command: String) -> bool;

    async fn run_retrying(&self, job_id: Uuid, run_id: Uuid, notice: RetryNotice);

    async fn run_finished(&self, job_id: Uuid, run_id: Uuid, report: RunReport);
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub output_dir: PathBuf,
}

pub struct Executor {
    sender: mpsc::UnboundedSender<RunTask>,
    shutdown: CancellationToken,
    limiter: RateLimiter,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunTask>>,
    sender: mpsc::UnboundedSender<RunTask>,
    adapters: Arc<AdapterRegistry>,
    limiter: RateLimiter,
    reporter: Arc<dyn RunReporter>,
    output_dir: PathBuf,
    shutdown: CancellationToken,
}

enum Attempt {
    Succeeded(ExecutionOutput),
    Failed {
        failure: FailureKind,
        reason: String,
        output: ExecutionOutput,
    },
}

impl Executor {
    /// Spawns the worker pool
    pub fn start(
        config: ExecutorConfig,
        adapters: Arc<AdapterRegistry>,
        limiter: RateLimiter,
        reporter: Arc<dyn RunReporter>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            receiver: tokio::sync::Mutex::new(receiver),
            sender: sender.clone(),
            adapters,
            limiter: limiter.clone(),
            reporter,
            output_dir: config.output_dir,
            shutdown: shutdown.clone(),
        });

        let workers = config.workers.max(1);
        let handles = (0..workers)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { shared.work(worker).await })
            })
            .collect();

        info!("Executor started with {} worker(s)", workers);

        Self {
            sender,
            shutdown,
            limiter,
            handles: Mutex::new(handles),
        }
    }

    /// Appends a run to the queue
    pub fn enqueue(&self, task: RunTask) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        self.sender
            .send(task)
            .map_err(|_| OrchestratorError::ShuttingDown)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops the workers after their current attempt
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Executor worker panicked: {}", e);
            }
        }
        info!("Executor stopped");
    }
}

impl Shared {
    async fn work(&self, worker: usize) {
        debug!("Worker {} started", worker);

        loop {
            let task = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    task = receiver.recv() => task,
                }
            };

            match task {
                Some(task) => self.process(task).await,
                None => break,
            }
        }

        debug!("Worker {} stopped", worker);
    }

    async fn process(&self, mut task: RunTask) {
        if task.abort.is_triggered() {
            return self.finish_aborted(task).await;
        }

        let Some(adapter) = self.adapters.get(&task.tool) else {
            let reason = format!("no adapter registered for tool '{}'", task.tool);
            warn!("Run {}: {}", task.run_id, reason);
            let outcome = RunOutcome::failed(RunStatus::Failed, FailureKind::AdapterMissing, reason);
            return self.finish(task, outcome, None, Vec::new()).await;
        };

        if let Err(reason) = adapter.validate_target(&task.target) {
            let outcome = RunOutcome::failed(RunStatus::Failed, FailureKind::InvalidTarget, reason);
            return self.finish(task, outcome, None, Vec::new()).await;
        }

        let cancel = task.abort.token().clone();
        let policy = Arc::clone(&task.policy);

        // Slot and permit are held until the run record leaves `running`
        let _job_slot = match task.job_slots.clone() {
            Some(slots) => tokio::select! {
                slot = slots.acquire_owned() => slot.ok(),
                _ = cancel.cancelled() => return self.finish_aborted(task).await,
            },
            None => None,
        };

        let key = task.target.limit_key();
        let permit = tokio::select! {
            permit = self.limiter.acquire(&key, &policy.limits) => permit,
            _ = cancel.cancelled() => return self.finish_aborted(task).await,
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Run {} ({}): {}", task.run_id, task.tool, e);
                let outcome =
                    RunOutcome::failed(RunStatus::Failed, FailureKind::RateLimited, e.to_string());
                return self.finish(task, outcome, None, Vec::new()).await;
            }
        };

        if task.abort.is_triggered() {
            drop(permit);
            return self.finish_aborted(task).await;
        }

        let timeout = policy.tool_timeout(&task.tool);
        let output_path = adapter::output_path(&self.output_dir, task.job_id, &task.tool, task.run_id);
        if let Some(parent) = output_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!("Failed to create output directory {}: {}", parent.display(), e);
        }

        let options = CommandOptions {
            timeout,
            explicit_approval: task.options.explicit_approval,
        };
        let command = match adapter.build_command(&task.target, &output_path, &options) {
            Ok(command) => command,
            Err(e) => {
                drop(permit);
                let outcome =
                    RunOutcome::failed(RunStatus::Failed, FailureKind::ExecutionError, e.to_string());
                return self.finish(task, outcome, None, Vec::new()).await;
            }
        };
        let command_line = command.display();
        let version = tokio::time::timeout(timeout, adapter.version())
            .await
            .unwrap_or_else(|_| {
                warn!("Version query for {} timed out", task.tool);
                None
            });

        if !self
            .reporter
            .run_started(task.job_id, task.run_id, command_line.clone())
            .await
        {
            debug!("Run {} may no longer start, dropping attempt", task.run_id);
            return;
        }
        task.attempts += 1;

        info!(
            "Run {} ({}) attempt {} started: {}",
            task.run_id, task.tool, task.attempts, command_line
        );

        let ctx = ExecutionContext {
            job_id: task.job_id,
            run_id: task.run_id,
            attempt: task.attempts,
            timeout,
            cancel: cancel.clone(),
        };
        let result = tokio::time::timeout(timeout, adapter.execute(&command, &ctx)).await;

        let attempt = match result {
            Ok(Ok(output)) if output.success() => Attempt::Succeeded(output),
            Ok(Ok(output)) => Attempt::Failed {
                failure: FailureKind::ExecutionError,
                reason: match output.exit_code {
                    Some(code) => format!("{} exited with status {}", task.tool, code),
                    None => format!("{} was terminated by a signal", task.tool),
                },
                output,
            },
            Ok(Err(e)) => Attempt::Failed {
                failure: FailureKind::ExecutionError,
                reason: e.to_string(),
                output: ExecutionOutput {
                    stderr: e.to_string().into_bytes(),
                    ..ExecutionOutput::default()
                },
            },
            Err(_) => Attempt::Failed {
                failure: FailureKind::Timeout,
                reason: format!("{} timed out after {:?}", task.tool, timeout),
                output: ExecutionOutput::default(),
            },
        };

        match attempt {
            Attempt::Succeeded(output) => {
                let evidence = Evidence::capture(
                    task.run_id,
                    command_line,
                    version,
                    output.stdout,
                    output.stderr,
                    output.exit_code,
                );

                let (findings, parse_error) = match adapter.parse_output(&evidence) {
                    Ok(parsed) => (adapter.to_findings(&parsed, task.run_id, evidence.id), None),
                    Err(e) => {
                        warn!("Run {} ({}): {}", task.run_id, task.tool, e);
                        (Vec::new(), Some(e.to_string()))
                    }
                };

                info!(
                    "Run {} ({}) succeeded with {} finding(s)",
                    task.run_id,
                    task.tool,
                    findings.len()
                );

                let outcome = RunOutcome::succeeded(0, evidence.id).with_parse_error(parse_error);
                self.finish(task, outcome, Some(evidence), findings).await;
            }
            Attempt::Failed {
                failure,
                reason,
                output,
            } => {
                let exit_code = output.exit_code;
                let evidence = Evidence::capture(
                    task.run_id,
                    command_line,
                    version,
                    output.stdout,
                    output.stderr,
                    exit_code,
                );

                if failure.is_retryable()
                    && task.attempts <= policy.retry.max_retries
                    && !task.abort.is_triggered()
                {
                    let delay = policy.retry.backoff(task.attempts);
                    let next_eligible_at = chrono::Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

                    info!(
                        "Run {} ({}) attempt {} failed: {}; retrying in {:?}",
                        task.run_id, task.tool, task.attempts, reason, delay
                    );

                    self.reporter
                        .run_retrying(
                            task.job_id,
                            task.run_id,
                            RetryNotice {
                                failure,
                                reason,
                                exit_code,
                                next_eligible_at,
                            },
                        )
                        .await;

                    task.last_evidence = Some(evidence);
                    self.requeue_after(task, delay);
                    return;
                }

                warn!(
                    "Run {} ({}) failed after {} attempt(s): {}",
                    task.run_id, task.tool, task.attempts, reason
                );

                let status = match failure {
                    FailureKind::Timeout => RunStatus::TimedOut,
                    _ => RunStatus::Failed,
                };
                let outcome = RunOutcome::failed(status, failure, reason).with_exit_code(exit_code);
                self.finish(task, outcome, Some(evidence), Vec::new()).await;
            }
        }
    }

    /// Re-queues a failed attempt once its backoff has elapsed
    ///
    /// Cancellation short-circuits the wait so the run is reported promptly.
    fn requeue_after(&self, task: RunTask, delay: Duration) {
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();
        let cancel = task.abort.token().clone();
        let run_id = task.run_id;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
                _ = shutdown.cancelled() => return,
            }
            if sender.send(task).is_err() {
                warn!("Executor queue closed, dropping retry of run {}", run_id);
            }
        });
    }

    async fn finish_aborted(&self, task: RunTask) {
        let failure = task.abort.reason().unwrap_or(FailureKind::Cancelled);
        let reason = match failure {
            FailureKind::FailFast => "aborted after another run of the job failed",
            _ => "job cancelled",
        };
        let outcome = RunOutcome::failed(RunStatus::Cancelled, failure, reason);
        self.finish(task, outcome, None, Vec::new()).await;
    }

    async fn finish(
        &self,
        mut task: RunTask,
        mut outcome: RunOutcome,
        evidence: Option<Evidence>,
        findings: Vec<Finding>,
    ) {
        let evidence = evidence.or(task.last_evidence.take());
        if let Some(evidence) = &evidence {
            outcome = outcome.with_evidence(evidence.id);
        }

        self.reporter
            .run_finished(
                task.job_id,
                task.run_id,
                RunReport {
                    outcome,
                    evidence,
                    findings,
                },
            )
            .await;
    }
}
