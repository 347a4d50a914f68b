//! Test doubles shared across unit tests

use crate::adapter::{
    AdapterError, CommandOptions, CommandSpec, ExecutionContext, ExecutionOutput, ToolAdapter,
};
use crate::executor::{RetryNotice, RunReport, RunReporter};
use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::{Finding, Severity};
use recon_core::domain::run::{FailureKind, RunStatus};
use recon_core::domain::target::Target;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Scripted behaviour of one attempt
#[derive(Debug, Clone)]
pub enum Step {
    Exit {
        code: i32,
        stdout: String,
        delay: Duration,
    },
    /// Never completes; only the executor timeout ends it
    Hang,
    /// Adapter level error, e.g. a missing binary
    Error,
}

impl Step {
    pub fn ok(stdout: &str) -> Self {
        Step::Exit {
            code: 0,
            stdout: stdout.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn exit(code: i32) -> Self {
        Step::Exit {
            code,
            stdout: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration, stdout: &str) -> Self {
        Step::Exit {
            code: 0,
            stdout: stdout.to_string(),
            delay,
        }
    }
}

/// Adapter that plays back a script and records concurrency
pub struct ScriptedAdapter {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    running_runs: Mutex<HashSet<Uuid>>,
    overlapped: AtomicBool,
    version_hangs: bool,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Self {
        Self::repeating(name, Step::ok(""))
    }

    pub fn repeating(name: &str, step: Step) -> Self {
        Self::with_fallback(name, Vec::new(), step)
    }

    /// Plays `steps` in order, then succeeds with empty output
    pub fn with_steps(name: &str, steps: Vec<Step>) -> Self {
        Self::with_fallback(name, steps, Step::ok(""))
    }

    pub fn with_fallback(name: &str, steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            running_runs: Mutex::new(HashSet::new()),
            overlapped: AtomicBool::new(false),
            version_hangs: false,
        }
    }

    /// `version()` never returns
    pub fn with_hanging_version(mut self) -> Self {
        self.version_hangs = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of attempts executing at the same time
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Whether two attempts of the same run ever executed together
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct ActiveGuard<'a> {
    adapter: &'a ScriptedAdapter,
    run_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.adapter.active.fetch_sub(1, Ordering::SeqCst);
        self.adapter.running_runs.lock().unwrap().remove(&self.run_id);
    }
}

#[async_trait]
impl ToolAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn version(&self) -> Option<String> {
        if self.version_hangs {
            std::future::pending::<()>().await;
        }
        Some("1.0.0".to_string())
    }

    fn build_command(
        &self,
        target: &Target,
        _output_path: &Path,
        _options: &CommandOptions,
    ) -> Result<CommandSpec, AdapterError> {
        Ok(CommandSpec::new(self.name.clone()).arg(target.value.clone()))
    }

    async fn execute(
        &self,
        _command: &CommandSpec,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.running_runs.lock().unwrap().insert(ctx.run_id) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let _guard = ActiveGuard {
            adapter: self,
            run_id: ctx.run_id,
        };

        match self.next_step() {
            Step::Exit {
                code,
                stdout,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ExecutionOutput {
                    stdout: stdout.into_bytes(),
                    stderr: Vec::new(),
                    exit_code: Some(code),
                })
            }
            Step::Hang => std::future::pending().await,
            Step::Error => Err(AdapterError::ToolNotFound(self.name.clone())),
        }
    }

    /// Lines become findings; output starting with `!` does not parse
    fn parse_output(&self, evidence: &Evidence) -> Result<serde_json::Value, AdapterError> {
        let text = evidence.stdout_lossy();
        if text.starts_with('!') {
            return Err(AdapterError::Parse("unexpected output".to_string()));
        }
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::Value::String(line.trim().to_string()))
            .collect())
    }

    fn to_findings(
        &self,
        parsed: &serde_json::Value,
        run_id: Uuid,
        evidence_id: Uuid,
    ) -> Vec<Finding> {
        parsed
            .as_array()
            .into_iter()
            .flatten()
            .map(|item| Finding {
                id: Uuid::new_v4(),
                run_id,
                evidence_id,
                tool: self.name.clone(),
                title: item.as_str().unwrap_or_default().to_string(),
                severity: Severity::Info,
                details: item.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReporterEvent {
    Started(Uuid),
    Retrying(Uuid, FailureKind),
    Finished(Uuid, RunStatus),
}

/// Reporter that records every event and forwards terminal reports
pub struct RecordingReporter {
    events: Mutex<Vec<ReporterEvent>>,
    finished: mpsc::UnboundedSender<(Uuid, RunReport)>,
}

impl RecordingReporter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Uuid, RunReport)>) {
        let (finished, receiver) = mpsc::unbounded_channel();
        let reporter = Arc::new(Self {
            events: Mutex::new(Vec::new()),
            finished,
        });
        (reporter, receiver)
    }

    pub fn events(&self) -> Vec<ReporterEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunReporter for RecordingReporter {
    async fn run_started(&self, _job_id: Uuid, run_id: Uuid, _command: String) -> bool {
        self.events
            .lock()
            .unwrap()
            .push(ReporterEvent::Started(run_id));
        true
    }

    async fn run_retrying(&self, _job_id: Uuid, run_id: Uuid, notice: RetryNotice) {
        self.events
            .lock()
            .unwrap()
            .push(ReporterEvent::Retrying(run_id, notice.failure));
    }

    async fn run_finished(&self, _job_id: Uuid, run_id: Uuid, report: RunReport) {
        self.events
            .lock()
            .unwrap()
            .push(ReporterEvent::Finished(run_id, report.outcome.status));
        let _ = self.finished.send((run_id, report));
    }
}
