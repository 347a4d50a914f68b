//! Schedule Service
//!
//! Keeps the schedule table and submits jobs when entries come due. Templates
//! are resolved against the policy active at fire time. Missed fires (engine
//! busy or asleep) are coalesced into one.

use crate::error::{OrchestratorError, Result};
use crate::service::job::Orchestrator;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use recon_core::domain::policy::Policy;
use recon_core::domain::schedule::{JobTemplate, ScheduleEntry, ToolSelection, Trigger};
use recon_core::domain::target::Target;
use recon_core::dto::job::JobRequest;
use recon_core::dto::schedule::CreateSchedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Longest accepted interval, ten years
const MAX_INTERVAL_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// Where scheduled jobs go
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: JobRequest) -> Result<Uuid>;

    /// Policy used to resolve templates
    fn active_policy(&self) -> Arc<Policy>;
}

#[async_trait]
impl JobSubmitter for Orchestrator {
    async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        Orchestrator::submit(self, request).await
    }

    fn active_policy(&self) -> Arc<Policy> {
        self.policies().current()
    }
}

pub struct Scheduler {
    entries: Mutex<HashMap<Uuid, ScheduleEntry>>,
    submitter: Arc<dyn JobSubmitter>,
    changed: Notify,
    tick: Duration,
}

impl Scheduler {
    /// `tick` bounds how long the loop sleeps between checks
    pub fn new(submitter: Arc<dyn JobSubmitter>, tick: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            submitter,
            changed: Notify::new(),
            tick,
        }
    }

    pub fn add(&self, request: CreateSchedule) -> Result<ScheduleEntry> {
        self.add_at(request, Utc::now())
    }

    /// Adds an entry as if created at `now`
    pub fn add_at(&self, request: CreateSchedule, now: DateTime<Utc>) -> Result<ScheduleEntry> {
        if request.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "schedule name must not be empty".to_string(),
            ));
        }
        Target::parse(&request.template.target, request.template.scope)
            .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?;
        if let ToolSelection::Named(names) = &request.template.tools
            && names.iter().all(|n| n.trim().is_empty())
        {
            return Err(OrchestratorError::InvalidRequest(
                "schedule template names no tools".to_string(),
            ));
        }

        let next_fire_at = first_fire(&request.trigger, now)?;
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            name: request.name,
            trigger: request.trigger,
            template: request.template,
            paused: request.paused,
            created_at: now,
            next_fire_at,
            last_fired_at: None,
            last_job_id: None,
            fire_count: 0,
        };

        info!(
            "Schedule {} ({}) added, next fire at {:?}",
            entry.id, entry.name, entry.next_fire_at
        );

        self.lock().insert(entry.id, entry.clone());
        self.changed.notify_one();
        Ok(entry)
    }

    /// Removes an entry; jobs it already spawned are unaffected
    pub fn remove(&self, id: Uuid) -> Result<ScheduleEntry> {
        let entry = self
            .lock()
            .remove(&id)
            .ok_or(OrchestratorError::ScheduleNotFound(id))?;
        info!("Schedule {} ({}) removed", entry.id, entry.name);
        self.changed.notify_one();
        Ok(entry)
    }

    pub fn pause(&self, id: Uuid) -> Result<ScheduleEntry> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(OrchestratorError::ScheduleNotFound(id))?;
        entry.paused = true;
        debug!("Schedule {} paused", id);
        Ok(entry.clone())
    }

    pub fn resume(&self, id: Uuid) -> Result<ScheduleEntry> {
        self.resume_at(id, Utc::now())
    }

    /// Resumes an entry; recurring triggers restart from `now` rather than
    /// firing for the paused period
    pub fn resume_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<ScheduleEntry> {
        let entry = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(&id)
                .ok_or(OrchestratorError::ScheduleNotFound(id))?;
            if entry.paused {
                entry.paused = false;
                if !matches!(entry.trigger, Trigger::Once { .. }) {
                    entry.next_fire_at = first_fire(&entry.trigger, now)?;
                }
            }
            entry.clone()
        };
        debug!("Schedule {} resumed, next fire at {:?}", id, entry.next_fire_at);
        self.changed.notify_one();
        Ok(entry)
    }

    pub fn get(&self, id: Uuid) -> Result<ScheduleEntry> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::ScheduleNotFound(id))
    }

    /// All entries, oldest first
    pub fn list(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<ScheduleEntry> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        entries
    }

    /// Earliest pending fire time among active entries
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .values()
            .filter(|entry| !entry.paused)
            .filter_map(|entry| entry.next_fire_at)
            .min()
    }

    /// Submits a job for every active entry due at `now`
    ///
    /// Returns the ids of the jobs submitted. Submission errors are logged
    /// and do not affect the entry's schedule.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<(Uuid, JobTemplate)> = {
            let mut entries = self.lock();
            entries
                .values_mut()
                .filter(|entry| !entry.paused && entry.next_fire_at.is_some_and(|at| at <= now))
                .map(|entry| {
                    entry.next_fire_at = advance(&entry.trigger, entry.next_fire_at, now);
                    entry.last_fired_at = Some(now);
                    entry.fire_count += 1;
                    (entry.id, entry.template.clone())
                })
                .collect()
        };

        if due.is_empty() {
            return Vec::new();
        }

        let policy = self.submitter.active_policy();
        let mut jobs = Vec::with_capacity(due.len());

        for (schedule_id, template) in due {
            let request = resolve_template(&template, &policy);
            match self.submitter.submit(request).await {
                Ok(job_id) => {
                    info!("Schedule {} submitted job {}", schedule_id, job_id);
                    if let Some(entry) = self.lock().get_mut(&schedule_id) {
                        entry.last_job_id = Some(job_id);
                    }
                    jobs.push(job_id);
                }
                Err(e) => {
                    error!("Schedule {} failed to submit job: {}", schedule_id, e);
                }
            }
        }

        jobs
    }

    /// Fires due entries until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Scheduler started (tick: {:?})", self.tick);

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            self.fire_due(Utc::now()).await;

            let wait = self
                .next_wakeup()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .map_or(self.tick, |until| until.min(self.tick));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut changed => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Scheduler stopped");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ScheduleEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Builds a concrete request from a template
pub fn resolve_template(template: &JobTemplate, policy: &Policy) -> JobRequest {
    let tools = match &template.tools {
        ToolSelection::Named(names) => names.clone(),
        ToolSelection::AllEnabled => policy.unattended_tools(),
    };

    JobRequest {
        target: template.target.clone(),
        scope: template.scope,
        tools,
        options: template.options.clone(),
        created_by: template.created_by.clone(),
    }
}

fn first_fire(trigger: &Trigger, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        Trigger::Cron { expression } => Ok(cron_schedule(expression)?.after(&now).next()),
        Trigger::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(OrchestratorError::InvalidRequest(
                    "interval must be at least one second".to_string(),
                ));
            }
            if *every_secs > MAX_INTERVAL_SECS {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "interval must be at most {} seconds",
                    MAX_INTERVAL_SECS
                )));
            }
            let next = now.checked_add_signed(TimeDelta::seconds(*every_secs as i64));
            next.map(Some).ok_or_else(|| {
                OrchestratorError::InvalidRequest("interval ends past the calendar".to_string())
            })
        }
        Trigger::Once { at } => Ok(Some(*at)),
    }
}

/// Next fire time after firing at `now`; intervals keep their cadence
fn advance(
    trigger: &Trigger,
    scheduled: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Cron { expression } => cron_schedule(expression)
            .ok()
            .and_then(|schedule| schedule.after(&now).next()),
        Trigger::Interval { every_secs } => {
            let every = TimeDelta::seconds((*every_secs).clamp(1, MAX_INTERVAL_SECS) as i64);
            let next = scheduled.unwrap_or(now).checked_add_signed(every)?;
            if next > now {
                return Some(next);
            }
            let missed = (now - next).num_seconds() / every.num_seconds() + 1;
            let skip = missed
                .checked_mul(every.num_seconds())
                .and_then(TimeDelta::try_seconds)?;
            next.checked_add_signed(skip)
        }
        Trigger::Once { .. } => None,
    }
}

fn cron_schedule(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression).map_err(|e| {
        OrchestratorError::InvalidRequest(format!("invalid cron expression '{}': {}", expression, e))
    })
}
