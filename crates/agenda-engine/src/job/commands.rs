use super::handler::BREAKPOINT;
use super::{manager, Job, JobRequest, JobTable, JOBS, TIMER_JOBS};
use crate::command::Command;
use crate::context::CommandContext;
use crate::events::EngineEvent;
use agenda_core::{EngineError, EngineResult, LogEntry, Loggable};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

pub struct CreateJobCmd {
    pub request: JobRequest,
}

impl Command for CreateJobCmd {
    type Output = Job;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        manager::create_job(ctx, self.request.clone())
    }

    fn description(&self) -> String {
        format!("Create '{}' job", self.request.handler_type)
    }
}

/// Move due timers to the executable table
pub struct AcquireTimerJobsCmd {
    pub max_jobs: usize,
}

impl Command for AcquireTimerJobsCmd {
    type Output = Vec<Job>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<Job>> {
        let now = ctx.now();
        let mut due = ctx.tx().query(TIMER_JOBS, |job| job.is_due(now))?;
        due.sort_by_key(|job| (job.due_date, job.created_at));

        let mut moved = Vec::new();
        for job in due.into_iter().take(self.max_jobs) {
            moved.push(manager::move_timer_to_executable(ctx, &job.id)?);
        }
        if !moved.is_empty() {
            tracing::debug!("Moved {} due timers to executable", moved.len());
        }
        Ok(moved)
    }

    fn description(&self) -> String {
        "Acquire due timer jobs".to_string()
    }
}

/// Lock up to `max_jobs` due executable jobs for `lock_owner`.
///
/// Exclusive jobs are only taken when no other exclusive job of the same
/// scope is locked, and at most one per scope per acquisition.
pub struct AcquireJobsCmd {
    pub lock_owner: String,
    pub max_jobs: usize,
}

impl Command for AcquireJobsCmd {
    type Output = Vec<Job>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<Job>> {
        let now = ctx.now();
        let scope = ctx.config().async_executor.exclusivity_scope;
        let lock_until = now + ctx.config().async_executor.lock_time();

        let all = ctx.tx().query(JOBS, |_| true)?;
        let mut busy: HashSet<String> = all
            .iter()
            .filter(|job| job.is_locked(now))
            .filter_map(|job| job.exclusivity_key(scope).map(str::to_string))
            .collect();
        let mut candidates: Vec<Job> = all
            .into_iter()
            .filter(|job| !job.is_locked(now) && job.retries > 0 && job.is_due(now))
            .collect();
        candidates.sort_by_key(|job| (job.due_date, job.created_at));

        let mut acquired = Vec::new();
        for mut job in candidates {
            if acquired.len() >= self.max_jobs {
                break;
            }
            if let Some(key) = job.exclusivity_key(scope) {
                if !busy.insert(key.to_string()) {
                    continue;
                }
            }
            job.lock(&self.lock_owner, lock_until);
            ctx.tx().update(JOBS, &job)?;
            acquired.push(job);
        }
        Ok(acquired)
    }

    fn description(&self) -> String {
        format!("Acquire jobs for {}", self.lock_owner)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome<T> {
    Locked(T),
    /// Already executed or moved elsewhere
    NotFound,
    LockedByOther,
    /// Another exclusive job of the same scope is running
    ExclusiveBusy,
}

/// Lock one job by id, as the message receiver does before running it
pub struct LockJobCmd {
    pub job_id: String,
    pub lock_owner: String,
}

impl Command for LockJobCmd {
    type Output = LockOutcome<Job>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<LockOutcome<Job>> {
        let now = ctx.now();
        let scope = ctx.config().async_executor.exclusivity_scope;
        let Some(mut job) = ctx.tx().find(JOBS, &self.job_id)? else {
            return Ok(LockOutcome::NotFound);
        };
        if job.is_locked(now) && job.lock_owner.as_deref() != Some(self.lock_owner.as_str()) {
            return Ok(LockOutcome::LockedByOther);
        }
        if let Some(key) = job.exclusivity_key(scope) {
            let running = ctx.tx().query(JOBS, |other| {
                other.id != job.id && other.is_locked(now) && other.exclusivity_key(scope) == Some(key)
            })?;
            if !running.is_empty() {
                return Ok(LockOutcome::ExclusiveBusy);
            }
        }
        job.lock(&self.lock_owner, now + ctx.config().async_executor.lock_time());
        ctx.tx().update(JOBS, &job)?;
        Ok(LockOutcome::Locked(job))
    }

    fn description(&self) -> String {
        format!("Lock job {}", self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExecution {
    Executed,
    /// The job is gone, e.g. a duplicate delivery after it already ran
    NotFound,
}

/// Run an executable job's handler and delete the job, in one transaction
pub struct ExecuteJobCmd {
    pub job_id: String,
}

impl Command for ExecuteJobCmd {
    type Output = JobExecution;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobExecution> {
        let Some(job) = ctx.tx().find(JOBS, &self.job_id)? else {
            tracing::debug!("Job {} no longer exists, skipping", self.job_id);
            return Ok(JobExecution::NotFound);
        };
        execute_job(ctx, &job)?;
        Ok(JobExecution::Executed)
    }

    fn description(&self) -> String {
        format!("Execute job {}", self.job_id)
    }
}

/// Delete the job and run its handler in the caller's transaction
pub(crate) fn execute_job(ctx: &mut CommandContext, job: &Job) -> EngineResult<()> {
    let handler = ctx
        .services()
        .job_handlers
        .get(&job.handler_type)
        .ok_or_else(|| EngineError::JobExecution {
            job_id: job.id.clone(),
            message: format!("no handler registered for type '{}'", job.handler_type),
        })?;
    ctx.tx().delete(JOBS, &job.id)?;
    handler.execute(job, ctx)?;
    ctx.emit(EngineEvent::JobExecuted {
        job_id: job.id.clone(),
        handler_type: job.handler_type.clone(),
    });
    Ok(())
}

/// Release a job's lock so it can be acquired again
pub struct UnacquireJobCmd {
    pub job_id: String,
}

impl Command for UnacquireJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let Some(mut job) = ctx.tx().find(JOBS, &self.job_id)? else {
            return Ok(false);
        };
        job.unlock();
        ctx.tx().update(JOBS, &job)?;
        Ok(true)
    }

    fn description(&self) -> String {
        format!("Unacquire job {}", self.job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResolution {
    /// Retries left; the job is a timer again
    Rescheduled { due: DateTime<Utc> },
    DeadLettered,
    /// Breakpoint job parked again for the debugger
    Suspended,
    /// The job no longer exists
    Gone,
}

/// Record a failed attempt of an executable job and decide where it goes next
pub struct HandleFailedJobCmd {
    pub job_id: String,
    pub message: String,
}

impl Command for HandleFailedJobCmd {
    type Output = FailureResolution;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<FailureResolution> {
        let now = ctx.now();
        let Some(mut job) = ctx.tx().find(JOBS, &self.job_id)? else {
            return Ok(FailureResolution::Gone);
        };
        job.exception_message = Some(self.message.clone());
        job.add_log(LogEntry::at(now, self.message.clone()));

        if job.handler_type == BREAKPOINT {
            manager::move_to_suspended(ctx, job)?;
            return Ok(FailureResolution::Suspended);
        }

        job.retries -= 1;
        if job.retries <= 0 {
            tracing::warn!(
                "Job {} ({}) has no retries left, moving to dead-letter: {}",
                job.id,
                job.handler_type,
                self.message
            );
            manager::move_to_dead_letter(ctx, job)?;
            return Ok(FailureResolution::DeadLettered);
        }

        let due = now + ctx.config().async_executor.retry_wait();
        tracing::info!(
            "Job {} failed, {} retries left, due again at {}",
            job.id,
            job.retries,
            due
        );
        manager::move_to_timer(ctx, job, due)?;
        Ok(FailureResolution::Rescheduled { due })
    }

    fn description(&self) -> String {
        format!("Handle failure of job {}", self.job_id)
    }
}

pub struct ListJobsCmd {
    pub table: JobTable,
}

impl Command for ListJobsCmd {
    type Output = Vec<Job>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<Job>> {
        let mut jobs = ctx.tx().query(self.table.table(), |_| true)?;
        jobs.sort_by_key(|job| (job.created_at, job.due_date));
        Ok(jobs)
    }

    fn description(&self) -> String {
        format!("List {} jobs", self.table)
    }
}

/// Look a job up in every table
pub struct FindJobCmd {
    pub job_id: String,
}

impl Command for FindJobCmd {
    type Output = Option<(JobTable, Job)>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<(JobTable, Job)>> {
        for table in JobTable::ALL {
            if let Some(job) = ctx.tx().find(table.table(), &self.job_id)? {
                return Ok(Some((table, job)));
            }
        }
        Ok(None)
    }

    fn description(&self) -> String {
        format!("Find job {}", self.job_id)
    }
}

/// Give a dead-letter job a new set of retries
pub struct MoveDeadLetterJobToExecutableCmd {
    pub job_id: String,
    pub retries: i32,
}

impl Command for MoveDeadLetterJobToExecutableCmd {
    type Output = Job;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        manager::move_dead_letter_to_executable(ctx, &self.job_id, self.retries)
    }

    fn description(&self) -> String {
        format!("Move dead-letter job {} to executable", self.job_id)
    }
}

pub struct MoveSuspendedJobToExecutableCmd {
    pub job_id: String,
}

impl Command for MoveSuspendedJobToExecutableCmd {
    type Output = Job;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        manager::move_suspended_to_executable(ctx, &self.job_id, true)
    }

    fn description(&self) -> String {
        format!("Move suspended job {} to executable", self.job_id)
    }
}

/// Delete a job from whichever table holds it
pub struct DeleteJobCmd {
    pub job_id: String,
}

impl Command for DeleteJobCmd {
    type Output = JobTable;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobTable> {
        for table in JobTable::ALL {
            if ctx.tx().delete(table.table(), &self.job_id)? {
                tracing::info!("Deleted {} job {}", table, self.job_id);
                return Ok(table);
            }
        }
        Err(EngineError::NotFound(format!("job {}", self.job_id)))
    }

    fn description(&self) -> String {
        format!("Delete job {}", self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use crate::job::handler::JobHandler;
    use agenda_core::{Clock, EngineConfig, ExclusivityScope, ManualClock};
    use chrono::Duration;
    use std::sync::Arc;

    struct Noop;

    impl JobHandler for Noop {
        fn handler_type(&self) -> &str {
            "noop"
        }

        fn execute(&self, _job: &Job, _ctx: &mut CommandContext) -> EngineResult<()> {
            Ok(())
        }
    }

    fn engine_with_clock(config: EngineConfig) -> (ProcessEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder()
            .with_config(config)
            .with_clock(clock.clone())
            .with_job_handler(Arc::new(Noop))
            .build();
        (engine, clock)
    }

    fn acquire(engine: &ProcessEngine, owner: &str, max: usize) -> Vec<Job> {
        engine
            .command_executor()
            .execute(&AcquireJobsCmd {
                lock_owner: owner.to_string(),
                max_jobs: max,
            })
            .unwrap()
    }

    #[test]
    fn test_exclusive_jobs_of_one_instance_are_not_acquired_together() {
        let (engine, _) = engine_with_clock(EngineConfig::default());
        for _ in 0..3 {
            engine
                .create_job(JobRequest::new("noop").exclusive_to("instance-1"))
                .unwrap();
        }
        engine
            .create_job(JobRequest::new("noop").exclusive_to("instance-2"))
            .unwrap();
        engine.create_job(JobRequest::new("noop")).unwrap();

        let first = acquire(&engine, "node-1", 10);
        assert_eq!(first.len(), 3);
        let instances: Vec<Option<&str>> = first
            .iter()
            .map(|j| j.process_instance_id.as_deref())
            .collect();
        assert_eq!(instances.iter().filter(|i| **i == Some("instance-1")).count(), 1);

        // instance-1 is still running on node-1
        assert!(acquire(&engine, "node-2", 10).is_empty());
    }

    #[test]
    fn test_exclusivity_per_execution_scope() {
        let mut config = EngineConfig::default();
        config.async_executor.exclusivity_scope = ExclusivityScope::Execution;
        let (engine, _) = engine_with_clock(config);
        for execution in ["e1", "e2"] {
            let mut request = JobRequest::new("noop").exclusive_to("instance-1");
            request.execution_id = Some(execution.to_string());
            engine.create_job(request).unwrap();
        }
        assert_eq!(acquire(&engine, "node-1", 10).len(), 2);
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let (engine, clock) = engine_with_clock(EngineConfig::default());
        engine.create_job(JobRequest::new("noop")).unwrap();

        assert_eq!(acquire(&engine, "node-1", 10).len(), 1);
        assert!(acquire(&engine, "node-2", 10).is_empty());

        clock.advance(Duration::minutes(6));
        let taken = acquire(&engine, "node-2", 10);
        assert_eq!(taken[0].lock_owner.as_deref(), Some("node-2"));
    }

    #[test]
    fn test_future_job_starts_as_timer_and_becomes_due() {
        let (engine, clock) = engine_with_clock(EngineConfig::default());
        let due = clock.now() + Duration::seconds(30);
        let job = engine
            .create_job(JobRequest::new("noop").due_at(due))
            .unwrap();
        assert_eq!(engine.jobs(JobTable::Timer).unwrap().len(), 1);

        let executor = engine.command_executor();
        let timers = AcquireTimerJobsCmd { max_jobs: 10 };
        assert!(executor.execute(&timers).unwrap().is_empty());

        clock.advance(Duration::seconds(31));
        let moved = executor.execute(&timers).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, job.id);
        assert_eq!(moved[0].correlation_id, job.correlation_id);
        assert!(engine.jobs(JobTable::Timer).unwrap().is_empty());
        assert_eq!(engine.jobs(JobTable::Executable).unwrap().len(), 1);
    }

    #[test]
    fn test_failures_reschedule_then_dead_letter() {
        let mut config = EngineConfig::default();
        config.async_executor.default_retries = 2;
        let (engine, clock) = engine_with_clock(config);
        let job = engine.create_job(JobRequest::new("noop")).unwrap();
        let executor = engine.command_executor();

        let fail = HandleFailedJobCmd {
            job_id: job.id.clone(),
            message: "connection refused".into(),
        };
        let resolution = executor.execute(&fail).unwrap();
        let expected_due = clock.now() + Duration::seconds(10);
        assert_eq!(resolution, FailureResolution::Rescheduled { due: expected_due });

        let timer = engine.jobs(JobTable::Timer).unwrap().remove(0);
        assert_eq!(timer.retries, 1);
        assert_eq!(timer.exception_log.len(), 1);

        clock.advance(Duration::seconds(11));
        executor
            .execute(&AcquireTimerJobsCmd { max_jobs: 10 })
            .unwrap();
        assert_eq!(executor.execute(&fail).unwrap(), FailureResolution::DeadLettered);

        let dead = engine.jobs(JobTable::DeadLetter).unwrap().remove(0);
        assert_eq!(dead.retries, 0);
        assert_eq!(dead.get_logs().len(), 2);
        assert_eq!(dead.exception_message.as_deref(), Some("connection refused"));

        // Dead-letter jobs are never acquired
        assert!(acquire(&engine, "node-1", 10).is_empty());

        let revived = engine.retry_dead_letter_job(&job.id, 3).unwrap();
        assert_eq!(revived.retries, 3);
        assert_eq!(acquire(&engine, "node-1", 10).len(), 1);
    }

    #[test]
    fn test_job_without_retries_is_rejected() {
        let (engine, _) = engine_with_clock(EngineConfig::default());
        for retries in [0, -1] {
            let err = engine
                .create_job(JobRequest::new("noop").with_retries(retries))
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation(ref m) if m.contains("retries")));
        }

        let mut config = EngineConfig::default();
        config.async_executor.default_retries = 0;
        let (engine, _) = engine_with_clock(config);
        assert!(engine.create_job(JobRequest::new("noop")).is_err());
        assert!(engine.jobs(JobTable::Executable).unwrap().is_empty());

        let job = engine
            .create_job(JobRequest::new("noop").with_retries(1))
            .unwrap();
        assert_eq!(acquire(&engine, "node-1", 10)[0].id, job.id);
    }

    #[test]
    fn test_execute_missing_job_is_benign() {
        let (engine, _) = engine_with_clock(EngineConfig::default());
        let outcome = engine
            .command_executor()
            .execute(&ExecuteJobCmd {
                job_id: "gone".into(),
            })
            .unwrap();
        assert_eq!(outcome, JobExecution::NotFound);
    }

    #[test]
    fn test_unknown_handler_type_fails_execution() {
        let (engine, _) = engine_with_clock(EngineConfig::default());
        let job = engine.create_job(JobRequest::new("mystery")).unwrap();
        let err = engine
            .command_executor()
            .execute(&ExecuteJobCmd {
                job_id: job.id.clone(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::JobExecution { .. }));
        // Rolled back: the job is still there
        assert_eq!(engine.jobs(JobTable::Executable).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_job_from_any_table() {
        let (engine, clock) = engine_with_clock(EngineConfig::default());
        let job = engine
            .create_job(JobRequest::new("noop").due_at(clock.now() + Duration::hours(1)))
            .unwrap();
        let executor = engine.command_executor();
        let table = executor
            .execute(&DeleteJobCmd {
                job_id: job.id.clone(),
            })
            .unwrap();
        assert_eq!(table, JobTable::Timer);
        assert!(matches!(
            executor.execute(&DeleteJobCmd { job_id: job.id }),
            Err(EngineError::NotFound(_))
        ));
    }
}
