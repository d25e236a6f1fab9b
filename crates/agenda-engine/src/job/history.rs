//! Audit trail of process execution.
//!
//! Operations record [`HistoryEntry`]s on the command context. Before commit
//! they are either written directly or bundled into one [`HistoryJob`], which
//! the async executor applies later in batches.

use super::commands::LockOutcome;
use super::handler::{HistoryJobHandler, HistoryJobOutcome, HISTORIC_ACTIVITIES};
use super::{manager, JOBS};
use crate::command::Command;
use crate::context::CommandContext;
use crate::executor::Destination;
use crate::process::Execution;
use agenda_core::{new_id, EngineError, EngineResult};
use agenda_persistence::{Entity, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HISTORY_JOBS: Table<HistoryJob> = Table::new("history_jobs");
pub const HISTORIC_ACTIVITY_TABLE: Table<HistoricActivity> = Table::new("historic_activities");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    ProcessStarted,
    ProcessCompleted,
    ActivityStarted,
    ActivityCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: HistoryEventType,
    pub process_instance_id: String,
    pub process_definition_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub activity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Position within the recording command; orders entries with equal timestamps
    #[serde(default)]
    pub sequence: u64,
}

impl HistoryEntry {
    fn for_instance(event: HistoryEventType, instance: &Execution, at: DateTime<Utc>) -> Self {
        Self {
            event,
            process_instance_id: instance.process_instance_id.clone(),
            process_definition_id: instance.process_definition_id.clone(),
            execution_id: None,
            activity_id: None,
            timestamp: at,
            sequence: 0,
        }
    }

    fn for_activity(
        event: HistoryEventType,
        execution: &Execution,
        activity_id: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: Some(execution.id.clone()),
            activity_id: Some(activity_id.to_string()),
            ..Self::for_instance(event, execution, at)
        }
    }

    pub fn process_started(instance: &Execution, at: DateTime<Utc>) -> Self {
        Self::for_instance(HistoryEventType::ProcessStarted, instance, at)
    }

    pub fn process_completed(instance: &Execution, at: DateTime<Utc>) -> Self {
        Self::for_instance(HistoryEventType::ProcessCompleted, instance, at)
    }

    pub fn activity_started(execution: &Execution, activity_id: &str, at: DateTime<Utc>) -> Self {
        Self::for_activity(HistoryEventType::ActivityStarted, execution, activity_id, at)
    }

    pub fn activity_completed(execution: &Execution, activity_id: &str, at: DateTime<Utc>) -> Self {
        Self::for_activity(HistoryEventType::ActivityCompleted, execution, activity_id, at)
    }
}

/// A written history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivity {
    pub id: String,
    #[serde(flatten)]
    pub entry: HistoryEntry,
}

impl Entity for HistoricActivity {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryJob {
    pub id: String,
    pub handler_type: String,
    pub payload: Vec<HistoryEntry>,
    pub retries: i32,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub lock_expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exception_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for HistoryJob {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HistoryJob {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.map_or(true, |until| until > now)
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

pub fn write_entry(ctx: &mut CommandContext, entry: HistoryEntry) -> EngineResult<()> {
    let record = HistoricActivity { id: new_id(), entry };
    ctx.tx().insert(HISTORIC_ACTIVITY_TABLE, &record)
}

/// Persist the entries a command recorded, directly or as a history job
pub(crate) fn flush(ctx: &mut CommandContext, entries: Vec<HistoryEntry>) -> EngineResult<()> {
    if !ctx.config().history.async_enabled {
        for entry in entries {
            write_entry(ctx, entry)?;
        }
        return Ok(());
    }
    let handler_type = ctx.services().history_handler.handler_type().to_string();
    let job = manager::create_history_job(ctx, &handler_type, entries)?;
    tracing::trace!("History job {} holds {} entries", job.id, job.payload.len());
    Ok(())
}

/// Writes `historic_activities` rows, at most `history.batch_size` per run
#[derive(Debug, Default, Clone, Copy)]
pub struct HistoricActivityJobHandler;

impl HistoryJobHandler for HistoricActivityJobHandler {
    fn handler_type(&self) -> &str {
        HISTORIC_ACTIVITIES
    }

    fn execute(
        &self,
        job: &mut HistoryJob,
        ctx: &mut CommandContext,
    ) -> EngineResult<HistoryJobOutcome> {
        let batch_size = ctx.config().history.batch_size.max(1);
        let take = batch_size.min(job.payload.len());
        for entry in job.payload.drain(..take) {
            write_entry(ctx, entry)?;
        }
        if job.payload.is_empty() {
            Ok(HistoryJobOutcome::Completed)
        } else {
            Ok(HistoryJobOutcome::Partial {
                remaining: job.payload.len(),
            })
        }
    }
}

/// Lock up to `max_jobs` unlocked history jobs with retries left
pub struct AcquireHistoryJobsCmd {
    pub lock_owner: String,
    pub max_jobs: usize,
}

impl Command for AcquireHistoryJobsCmd {
    type Output = Vec<HistoryJob>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<HistoryJob>> {
        let now = ctx.now();
        let lock_time = ctx.config().async_executor.lock_time();
        let mut candidates = ctx
            .tx()
            .query(HISTORY_JOBS, |job| !job.is_locked(now) && job.retries > 0)?;
        candidates.sort_by_key(|job| job.created_at);

        let mut acquired = Vec::new();
        for mut job in candidates.into_iter().take(self.max_jobs) {
            job.lock_owner = Some(self.lock_owner.clone());
            job.lock_expiration = Some(now + lock_time);
            ctx.tx().update(HISTORY_JOBS, &job)?;
            acquired.push(job);
        }
        Ok(acquired)
    }

    fn description(&self) -> String {
        format!("Acquire history jobs for {}", self.lock_owner)
    }
}

pub struct LockHistoryJobCmd {
    pub job_id: String,
    pub lock_owner: String,
}

impl Command for LockHistoryJobCmd {
    type Output = LockOutcome<HistoryJob>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<LockOutcome<HistoryJob>> {
        let now = ctx.now();
        let Some(mut job) = ctx.tx().find(HISTORY_JOBS, &self.job_id)? else {
            return Ok(LockOutcome::NotFound);
        };
        if job.is_locked(now) && job.lock_owner.as_deref() != Some(self.lock_owner.as_str()) {
            return Ok(LockOutcome::LockedByOther);
        }
        job.lock_owner = Some(self.lock_owner.clone());
        job.lock_expiration = Some(now + ctx.config().async_executor.lock_time());
        ctx.tx().update(HISTORY_JOBS, &job)?;
        Ok(LockOutcome::Locked(job))
    }

    fn description(&self) -> String {
        format!("Lock history job {}", self.job_id)
    }
}

/// Apply a history job. The id must match exactly one history job; anything
/// else is a data integrity failure that is reported, not retried.
pub struct ExecuteHistoryJobCmd {
    pub job_id: String,
}

impl Command for ExecuteHistoryJobCmd {
    type Output = HistoryJobOutcome;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<HistoryJobOutcome> {
        let mut matches = ctx.tx().query(HISTORY_JOBS, |job| job.id == self.job_id)?;
        let mut job = match matches.len() {
            1 => matches.remove(0),
            0 if ctx.tx().find(JOBS, &self.job_id)?.is_some() => {
                return Err(EngineError::JobDataIntegrity(format!(
                    "job {} is not a history job",
                    self.job_id
                )))
            }
            0 => {
                return Err(EngineError::JobDataIntegrity(format!(
                    "no history job found with id {}",
                    self.job_id
                )))
            }
            n => {
                return Err(EngineError::JobDataIntegrity(format!(
                    "{} history jobs found with id {}",
                    n, self.job_id
                )))
            }
        };

        let handler = std::sync::Arc::clone(&ctx.services().history_handler);
        if handler.handler_type() != job.handler_type {
            return Err(EngineError::JobDataIntegrity(format!(
                "no history handler for type '{}' of job {}",
                job.handler_type, job.id
            )));
        }

        let outcome = handler.execute(&mut job, ctx)?;
        match &outcome {
            HistoryJobOutcome::Completed => {
                ctx.tx().delete(HISTORY_JOBS, &job.id)?;
            }
            HistoryJobOutcome::Partial { remaining } => {
                tracing::debug!("History job {} has {} entries left", job.id, remaining);
                job.unlock();
                ctx.tx().update(HISTORY_JOBS, &job)?;
                manager::dispatch_on_commit(ctx, Destination::HistoryJobs, &job.id);
            }
        }
        Ok(outcome)
    }

    fn description(&self) -> String {
        format!("Execute history job {}", self.job_id)
    }
}

pub struct UnacquireHistoryJobCmd {
    pub job_id: String,
}

impl Command for UnacquireHistoryJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let Some(mut job) = ctx.tx().find(HISTORY_JOBS, &self.job_id)? else {
            return Ok(false);
        };
        job.unlock();
        ctx.tx().update(HISTORY_JOBS, &job)?;
        Ok(true)
    }

    fn description(&self) -> String {
        format!("Unacquire history job {}", self.job_id)
    }
}

/// Count a failed attempt; a history job without retries is no longer acquired
pub struct HandleFailedHistoryJobCmd {
    pub job_id: String,
    pub message: String,
}

impl Command for HandleFailedHistoryJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let Some(mut job) = ctx.tx().find(HISTORY_JOBS, &self.job_id)? else {
            return Ok(false);
        };
        job.retries = (job.retries - 1).max(0);
        job.exception_message = Some(self.message.clone());
        job.unlock();
        ctx.tx().update(HISTORY_JOBS, &job)?;
        if job.retries == 0 {
            tracing::warn!("History job {} ran out of retries: {}", job.id, self.message);
        }
        Ok(true)
    }

    fn description(&self) -> String {
        format!("Handle failure of history job {}", self.job_id)
    }
}

pub struct ListHistoryJobsCmd;

impl Command for ListHistoryJobsCmd {
    type Output = Vec<HistoryJob>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<HistoryJob>> {
        let mut jobs = ctx.tx().query(HISTORY_JOBS, |_| true)?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    fn description(&self) -> String {
        "List history jobs".to_string()
    }
}

/// Written history, oldest first, optionally for one process instance
pub struct HistoricActivitiesCmd {
    pub process_instance_id: Option<String>,
}

impl Command for HistoricActivitiesCmd {
    type Output = Vec<HistoricActivity>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<HistoricActivity>> {
        let filter = self.process_instance_id.as_deref();
        let mut records = ctx.tx().query(HISTORIC_ACTIVITY_TABLE, |record| {
            filter.map_or(true, |id| record.entry.process_instance_id == id)
        })?;
        records.sort_by_key(|record| (record.entry.timestamp, record.entry.sequence));
        Ok(records)
    }

    fn description(&self) -> String {
        "List historic activities".to_string()
    }
}
