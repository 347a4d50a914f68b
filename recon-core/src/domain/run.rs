//! Run domain types
//!
//! A run is one tool execution belonging to exactly one job. Retry state is
//! kept on the record itself (attempt count plus next eligible time) so it
//! survives being persisted and reloaded.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One tool execution within a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub job_id: Uuid,
    pub tool: String,
    pub status: RunStatus,
    /// Command line actually executed on the latest attempt
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    /// Number of attempts that reached `running`
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    pub reason: Option<String>,
    /// Set when the tool ran successfully but its output could not be parsed
    pub parse_error: Option<String>,
    pub next_eligible_at: Option<chrono::DateTime<chrono::Utc>>,
    pub queued_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub evidence_id: Option<Uuid>,
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Why a run did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PolicyViolation,
    ExecutionError,
    Timeout,
    RateLimited,
    Cancelled,
    FailFast,
    AdapterMissing,
    InvalidTarget,
}

impl FailureKind {
    /// Whether the executor may retry a run that failed for this reason
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::ExecutionError | FailureKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::ExecutionError => "execution_error",
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Cancelled => "cancelled",
            FailureKind::FailFast => "fail_fast",
            FailureKind::AdapterMissing => "adapter_missing",
            FailureKind::InvalidTarget => "invalid_target",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::TimedOut | RunStatus::Cancelled
        )
    }

    /// Allowed moves: queued to running or straight to a terminal state
    /// (skipped, cancelled, rate limited), running to queued (retry) or to a
    /// terminal state.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Queued => next != RunStatus::Queued && next != RunStatus::TimedOut,
            RunStatus::Running => next != RunStatus::Running,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl Run {
    /// Creates a run waiting for a worker
    pub fn queued(job_id: Uuid, tool: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            tool: tool.into(),
            status: RunStatus::Queued,
            command: None,
            exit_code: None,
            attempts: 0,
            failure: None,
            reason: None,
            parse_error: None,
            next_eligible_at: None,
            queued_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            evidence_id: None,
        }
    }

    /// Creates a run that was refused before execution
    pub fn skipped(
        job_id: Uuid,
        tool: impl Into<String>,
        failure: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        let mut run = Self::queued(job_id, tool);
        run.status = RunStatus::Failed;
        run.failure = Some(failure);
        run.reason = Some(reason.into());
        run.completed_at = Some(run.queued_at);
        run
    }

    /// Marks the start of a new attempt
    pub fn mark_running(&mut self, command: String) -> bool {
        if !self.status.can_transition_to(RunStatus::Running) {
            return false;
        }
        self.status = RunStatus::Running;
        self.attempts += 1;
        self.command = Some(command);
        self.next_eligible_at = None;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now());
        }
        true
    }

    /// Puts a failed attempt back in the queue until `next_eligible_at`
    pub fn schedule_retry(
        &mut self,
        failure: FailureKind,
        reason: String,
        exit_code: Option<i32>,
        next_eligible_at: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        if self.status != RunStatus::Running {
            return false;
        }
        self.status = RunStatus::Queued;
        self.failure = Some(failure);
        self.reason = Some(reason);
        self.exit_code = exit_code;
        self.next_eligible_at = Some(next_eligible_at);
        true
    }

    /// Moves the run to a terminal status
    pub fn finish(&mut self, outcome: RunOutcome) -> bool {
        if !outcome.status.is_terminal() || !self.status.can_transition_to(outcome.status) {
            return false;
        }
        self.status = outcome.status;
        self.failure = outcome.failure;
        self.reason = outcome.reason;
        if outcome.exit_code.is_some() {
            self.exit_code = outcome.exit_code;
        }
        self.parse_error = outcome.parse_error;
        self.evidence_id = outcome.evidence_id.or(self.evidence_id);
        self.next_eligible_at = None;
        self.completed_at = Some(chrono::Utc::now());
        true
    }
}

/// Terminal result reported for a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub failure: Option<FailureKind>,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub parse_error: Option<String>,
    pub evidence_id: Option<Uuid>,
}

impl RunOutcome {
    pub fn succeeded(exit_code: i32, evidence_id: Uuid) -> Self {
        Self {
            status: RunStatus::Succeeded,
            failure: None,
            reason: None,
            exit_code: Some(exit_code),
            parse_error: None,
            evidence_id: Some(evidence_id),
        }
    }

    /// A terminal non-success outcome
    pub fn failed(status: RunStatus, failure: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            status,
            failure: Some(failure),
            reason: Some(reason.into()),
            exit_code: None,
            parse_error: None,
            evidence_id: None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::failed(RunStatus::Cancelled, FailureKind::Cancelled, reason)
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_evidence(mut self, evidence_id: Uuid) -> Self {
        self.evidence_id = Some(evidence_id);
        self
    }

    pub fn with_parse_error(mut self, parse_error: Option<String>) -> Self {
        self.parse_error = parse_error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_lifecycle() {
        let mut run = Run::queued(Uuid::new_v4(), "toolA");
        assert!(run.mark_running("toolA example.com".to_string()));
        assert_eq!(run.attempts, 1);

        let retry_at = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert!(run.schedule_retry(FailureKind::ExecutionError, "exit 1".into(), Some(1), retry_at));
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.next_eligible_at, Some(retry_at));

        assert!(run.mark_running("toolA example.com".to_string()));
        assert_eq!(run.attempts, 2);
        assert!(run.finish(RunOutcome::succeeded(0, Uuid::new_v4())));
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.failure.is_none());
        assert!(run.next_eligible_at.is_none());
    }

    #[test]
    fn test_terminal_run_is_final() {
        let mut run = Run::queued(Uuid::new_v4(), "toolA");
        assert!(run.finish(RunOutcome::cancelled("job cancelled")));
        assert!(!run.mark_running("late".to_string()));
        assert!(!run.finish(RunOutcome::succeeded(0, Uuid::new_v4())));
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.attempts, 0);
    }

    #[test]
    fn test_queued_run_cannot_time_out() {
        let mut run = Run::queued(Uuid::new_v4(), "toolA");
        let outcome = RunOutcome::failed(RunStatus::TimedOut, FailureKind::Timeout, "slow");
        assert!(!run.finish(outcome));
    }

    #[test]
    fn test_skipped_run() {
        let run = Run::skipped(
            Uuid::new_v4(),
            "nuke",
            FailureKind::PolicyViolation,
            "tool 'nuke' is high risk and requires explicit approval",
        );
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(FailureKind::PolicyViolation));
        assert_eq!(run.attempts, 0);
        assert!(run.evidence_id.is_none());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::ExecutionError.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::PolicyViolation.is_retryable());
    }
}
