//! Creating jobs and moving them between their tables.
//!
//! Every function works inside the caller's transaction. In message-queue
//! mode, a job that becomes executable is announced on the transport once
//! the transaction has committed, never before.

use super::handler::{ASYNC_CONTINUATION, BREAKPOINT, TRIGGER_TIMER};
use super::history::{HistoryEntry, HistoryJob, HISTORY_JOBS};
use super::{Job, JobRequest, JobTable, DEADLETTER_JOBS, JOBS, SUSPENDED_JOBS, TIMER_JOBS};
use crate::context::{CommandContext, TransactionListener, TransactionState};
use crate::events::EngineEvent;
use crate::executor::Destination;
use crate::process::Execution;
use agenda_core::{new_id, EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;

fn new_job(ctx: &CommandContext, request: JobRequest) -> Job {
    let id = new_id();
    Job {
        correlation_id: id.clone(),
        id,
        handler_type: request.handler_type,
        handler_configuration: request.handler_configuration,
        execution_id: request.execution_id,
        process_instance_id: request.process_instance_id,
        process_definition_id: request.process_definition_id,
        exclusive: request.exclusive,
        retries: request
            .retries
            .unwrap_or(ctx.config().async_executor.default_retries),
        due_date: request.due_date,
        lock_owner: None,
        lock_expiration: None,
        exception_message: None,
        exception_log: Vec::new(),
        created_at: ctx.now(),
    }
}

/// Persist a job from a request: as a timer when due in the future,
/// otherwise as executable.
pub fn create_job(ctx: &mut CommandContext, request: JobRequest) -> EngineResult<Job> {
    if request.handler_type.trim().is_empty() {
        return Err(EngineError::Validation(
            "job handler type must not be empty".to_string(),
        ));
    }
    if ctx.services().job_handlers.get(&request.handler_type).is_none() {
        tracing::warn!(
            "Creating job for unregistered handler type '{}'",
            request.handler_type
        );
    }

    let job = new_job(ctx, request);
    // Acquisition skips jobs without retries, so such a job would never run
    if job.retries <= 0 {
        return Err(EngineError::Validation(format!(
            "job retries must be positive, got {}",
            job.retries
        )));
    }
    match job.due_date {
        Some(due) if due > ctx.now() => {
            ctx.tx().insert(TIMER_JOBS, &job)?;
        }
        _ => insert_executable(ctx, &job)?,
    }
    ctx.emit(EngineEvent::JobCreated {
        job_id: job.id.clone(),
        handler_type: job.handler_type.clone(),
    });
    Ok(job)
}

pub fn schedule_async_continuation(
    ctx: &mut CommandContext,
    execution: &Execution,
    exclusive: bool,
) -> EngineResult<Job> {
    create_job(
        ctx,
        JobRequest::new(ASYNC_CONTINUATION).for_execution(execution, exclusive),
    )
}

pub fn schedule_timer(
    ctx: &mut CommandContext,
    execution: &Execution,
    activity_id: &str,
    due: DateTime<Utc>,
) -> EngineResult<Job> {
    let request = JobRequest::new(TRIGGER_TIMER)
        .for_execution(execution, true)
        .with_configuration(activity_id)
        .due_at(due);
    let job = new_job(ctx, request);
    ctx.tx().insert(TIMER_JOBS, &job)?;
    tracing::debug!("Timer {} for {} due at {}", job.id, execution.id, due);
    Ok(job)
}

/// Park a breakpoint job for an execution, reusing one that already exists
pub fn suspend_breakpoint(ctx: &mut CommandContext, execution: &Execution) -> EngineResult<Job> {
    let existing = ctx.tx().query(SUSPENDED_JOBS, |job| {
        job.handler_type == BREAKPOINT && job.execution_id.as_deref() == Some(execution.id.as_str())
    })?;
    if let Some(job) = existing.into_iter().next() {
        return Ok(job);
    }

    let mut request = JobRequest::new(BREAKPOINT).for_execution(execution, true);
    request.handler_configuration = execution.activity_id.clone();
    let job = new_job(ctx, request);
    ctx.tx().insert(SUSPENDED_JOBS, &job)?;
    Ok(job)
}

/// Insert into the executable table and announce it after commit
pub fn insert_executable(ctx: &mut CommandContext, job: &Job) -> EngineResult<()> {
    ctx.tx().insert(JOBS, job)?;
    dispatch_on_commit(ctx, Destination::Jobs, &job.id);
    Ok(())
}

fn take(ctx: &mut CommandContext, table: JobTable, job_id: &str) -> EngineResult<Job> {
    let job = ctx
        .tx()
        .find(table.table(), job_id)?
        .ok_or_else(|| EngineError::NotFound(format!("{} job {}", table, job_id)))?;
    ctx.tx().delete(table.table(), job_id)?;
    Ok(job)
}

pub fn move_timer_to_executable(ctx: &mut CommandContext, job_id: &str) -> EngineResult<Job> {
    let mut job = take(ctx, JobTable::Timer, job_id)?;
    job.due_date = None;
    job.unlock();
    insert_executable(ctx, &job)?;
    Ok(job)
}

/// Failed job with retries left: due again after `due`
pub fn move_to_timer(
    ctx: &mut CommandContext,
    mut job: Job,
    due: DateTime<Utc>,
) -> EngineResult<Job> {
    ctx.tx().delete(JOBS, &job.id)?;
    job.unlock();
    job.due_date = Some(due);
    ctx.tx().insert(TIMER_JOBS, &job)?;
    Ok(job)
}

pub fn move_to_dead_letter(ctx: &mut CommandContext, mut job: Job) -> EngineResult<Job> {
    ctx.tx().delete(JOBS, &job.id)?;
    job.unlock();
    job.retries = 0;
    ctx.tx().insert(DEADLETTER_JOBS, &job)?;
    Ok(job)
}

pub fn move_to_suspended(ctx: &mut CommandContext, mut job: Job) -> EngineResult<Job> {
    ctx.tx().delete(JOBS, &job.id)?;
    job.unlock();
    ctx.tx().insert(SUSPENDED_JOBS, &job)?;
    Ok(job)
}

pub fn move_dead_letter_to_executable(
    ctx: &mut CommandContext,
    job_id: &str,
    retries: i32,
) -> EngineResult<Job> {
    if retries <= 0 {
        return Err(EngineError::Validation(format!(
            "retries must be positive, got {}",
            retries
        )));
    }
    let mut job = take(ctx, JobTable::DeadLetter, job_id)?;
    job.retries = retries;
    job.due_date = None;
    job.exception_message = None;
    insert_executable(ctx, &job)?;
    Ok(job)
}

/// With `dispatch` false the caller executes the job itself in this transaction
pub fn move_suspended_to_executable(
    ctx: &mut CommandContext,
    job_id: &str,
    dispatch: bool,
) -> EngineResult<Job> {
    let job = take(ctx, JobTable::Suspended, job_id)?;
    if dispatch {
        insert_executable(ctx, &job)?;
    } else {
        ctx.tx().insert(JOBS, &job)?;
    }
    Ok(job)
}

pub fn delete_timers_for_execution(
    ctx: &mut CommandContext,
    execution_id: &str,
) -> EngineResult<usize> {
    let timers = ctx
        .tx()
        .query(TIMER_JOBS, |job| job.execution_id.as_deref() == Some(execution_id))?;
    for timer in &timers {
        ctx.tx().delete(TIMER_JOBS, &timer.id)?;
    }
    Ok(timers.len())
}

pub fn create_history_job(
    ctx: &mut CommandContext,
    handler_type: &str,
    payload: Vec<HistoryEntry>,
) -> EngineResult<HistoryJob> {
    let job = HistoryJob {
        id: new_id(),
        handler_type: handler_type.to_string(),
        payload,
        retries: ctx.config().history.default_retries,
        lock_owner: None,
        lock_expiration: None,
        exception_message: None,
        created_at: ctx.now(),
    };
    ctx.tx().insert(HISTORY_JOBS, &job)?;
    dispatch_on_commit(ctx, Destination::HistoryJobs, &job.id);
    Ok(job)
}

/// Sends one job id on the transport after the creating transaction committed
struct SendJobMessage {
    destination: Destination,
    job_id: String,
}

impl TransactionListener for SendJobMessage {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        match &ctx.services().transport {
            Some(transport) => transport.send(self.destination, &self.job_id),
            None => Ok(()),
        }
    }

    fn description(&self) -> String {
        format!("send {} to {:?}", self.job_id, self.destination)
    }
}

pub(crate) fn dispatch_on_commit(
    ctx: &mut CommandContext,
    destination: Destination,
    job_id: &str,
) {
    let services = ctx.services();
    if !services.config.async_executor.message_queue_mode || services.transport.is_none() {
        return;
    }
    ctx.add_transaction_listener(
        TransactionState::Committed,
        Arc::new(SendJobMessage {
            destination,
            job_id: job_id.to_string(),
        }),
    );
}
