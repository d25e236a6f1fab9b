//! What happens to a job whose execution failed.
//!
//! Handlers are consulted in order; the first one returning `true` has dealt
//! with the failure.

use super::commands::{HandleFailedJobCmd, UnacquireJobCmd};
use super::history::{HandleFailedHistoryJobCmd, UnacquireHistoryJobCmd};
use super::JobKind;
use crate::command::CommandExecutor;
use agenda_core::{EngineError, EngineResult};
use std::sync::Arc;

#[derive(Debug)]
pub struct FailedJob<'a> {
    pub job_id: &'a str,
    pub kind: JobKind,
    pub error: &'a EngineError,
}

pub trait JobExceptionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns whether the failure was handled
    fn handle(&self, executor: &CommandExecutor, failed: &FailedJob<'_>) -> EngineResult<bool>;
}

/// A concurrent update means someone else touched the job's data; the attempt
/// does not count against its retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnacquireOnOptimisticLocking;

impl JobExceptionHandler for UnacquireOnOptimisticLocking {
    fn name(&self) -> &'static str {
        "unacquire-on-optimistic-locking"
    }

    fn handle(&self, executor: &CommandExecutor, failed: &FailedJob<'_>) -> EngineResult<bool> {
        if !failed.error.is_optimistic_locking() {
            return Ok(false);
        }
        tracing::debug!(
            "Job {} hit a concurrent update, releasing it without using a retry",
            failed.job_id
        );
        let job_id = failed.job_id.to_string();
        match failed.kind {
            JobKind::Runtime => executor.execute(&UnacquireJobCmd { job_id })?,
            JobKind::History => executor.execute(&UnacquireHistoryJobCmd { job_id })?,
        };
        Ok(true)
    }
}

/// Counts the failure against the job's retries
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultJobExceptionHandler;

impl JobExceptionHandler for DefaultJobExceptionHandler {
    fn name(&self) -> &'static str {
        "default"
    }

    fn handle(&self, executor: &CommandExecutor, failed: &FailedJob<'_>) -> EngineResult<bool> {
        let job_id = failed.job_id.to_string();
        let message = failed.error.to_string();
        match failed.kind {
            JobKind::Runtime => {
                let resolution = executor.execute(&HandleFailedJobCmd { job_id, message })?;
                tracing::debug!("Failed job {} resolved as {:?}", failed.job_id, resolution);
            }
            JobKind::History => {
                executor.execute(&HandleFailedHistoryJobCmd { job_id, message })?;
            }
        }
        Ok(true)
    }
}

pub fn default_exception_handlers() -> Vec<Arc<dyn JobExceptionHandler>> {
    vec![
        Arc::new(UnacquireOnOptimisticLocking),
        Arc::new(DefaultJobExceptionHandler),
    ]
}

/// Run the handlers in order until one takes the failure
pub fn handle_failure(
    handlers: &[Arc<dyn JobExceptionHandler>],
    executor: &CommandExecutor,
    failed: &FailedJob<'_>,
) -> EngineResult<()> {
    for handler in handlers {
        if handler.handle(executor, failed)? {
            tracing::trace!("Failure of job {} handled by '{}'", failed.job_id, handler.name());
            return Ok(());
        }
    }
    tracing::warn!("No exception handler took the failure of job {}", failed.job_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use crate::job::{JobRequest, JobTable};

    #[test]
    fn test_optimistic_locking_failure_keeps_retries() {
        let engine = ProcessEngine::builder().build();
        let job = engine.create_job(JobRequest::new("noop")).unwrap();
        engine
            .command_executor()
            .execute(&crate::job::AcquireJobsCmd {
                lock_owner: "node-1".into(),
                max_jobs: 1,
            })
            .unwrap();

        let error = EngineError::optimistic_locking("executions", "e1");
        let failed = FailedJob {
            job_id: &job.id,
            kind: JobKind::Runtime,
            error: &error,
        };
        handle_failure(&default_exception_handlers(), engine.command_executor(), &failed).unwrap();

        let job = engine.jobs(JobTable::Executable).unwrap().remove(0);
        assert_eq!(job.retries, 3);
        assert!(job.lock_owner.is_none());
    }

    #[test]
    fn test_other_failures_use_a_retry() {
        let engine = ProcessEngine::builder().build();
        let job = engine.create_job(JobRequest::new("noop")).unwrap();

        let error = EngineError::Validation("bad input".into());
        let failed = FailedJob {
            job_id: &job.id,
            kind: JobKind::Runtime,
            error: &error,
        };
        handle_failure(&default_exception_handlers(), engine.command_executor(), &failed).unwrap();

        assert!(engine.jobs(JobTable::Executable).unwrap().is_empty());
        let timer = engine.jobs(JobTable::Timer).unwrap().remove(0);
        assert_eq!(timer.retries, 2);
        assert!(timer
            .exception_message
            .as_deref()
            .is_some_and(|m| m.contains("bad input")));
    }
}
