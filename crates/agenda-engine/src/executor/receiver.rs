//! Consumers of job ids delivered by a [`MessageTransport`](super::MessageTransport).

use super::runnable::{ExecuteAsyncRunnable, JobRunOutcome};
use crate::command::CommandExecutor;
use crate::job::exception::JobExceptionHandler;
use crate::job::history::LockHistoryJobCmd;
use crate::job::{JobKind, LockJobCmd, LockOutcome};
use agenda_core::EngineResult;
use std::sync::Arc;

/// Locks a delivered runtime job and runs it.
#[derive(Clone)]
pub struct JobMessageReceiver {
    executor: Arc<CommandExecutor>,
    exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
    lock_owner: String,
}

impl JobMessageReceiver {
    pub fn new(
        executor: Arc<CommandExecutor>,
        exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
        lock_owner: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            exception_handlers,
            lock_owner: lock_owner.into(),
        }
    }

    pub fn on_message(&self, job_id: &str) -> EngineResult<JobRunOutcome> {
        let outcome = self.executor.execute(&LockJobCmd {
            job_id: job_id.to_string(),
            lock_owner: self.lock_owner.clone(),
        })?;
        match outcome {
            LockOutcome::Locked(job) => ExecuteAsyncRunnable::new(
                Arc::clone(&self.executor),
                Arc::clone(&self.exception_handlers),
                job.id,
                JobKind::Runtime,
            )
            .run(),
            LockOutcome::NotFound => {
                tracing::debug!("Message for job {} that no longer exists", job_id);
                Ok(JobRunOutcome::Skipped)
            }
            LockOutcome::LockedByOther | LockOutcome::ExclusiveBusy => {
                tracing::debug!("Job {} cannot run now: {:?}", job_id, outcome);
                Ok(JobRunOutcome::Deferred)
            }
        }
    }
}

/// Runs delivered history jobs. An id that does not match exactly one
/// history job is a data integrity error and returned, never retried.
#[derive(Clone)]
pub struct AsyncHistoryJobMessageReceiver {
    executor: Arc<CommandExecutor>,
    exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
    lock_owner: String,
}

impl AsyncHistoryJobMessageReceiver {
    pub fn new(
        executor: Arc<CommandExecutor>,
        exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
        lock_owner: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            exception_handlers,
            lock_owner: lock_owner.into(),
        }
    }

    pub fn on_message(&self, job_id: &str) -> EngineResult<JobRunOutcome> {
        let outcome = self.executor.execute(&LockHistoryJobCmd {
            job_id: job_id.to_string(),
            lock_owner: self.lock_owner.clone(),
        })?;
        match outcome {
            LockOutcome::LockedByOther | LockOutcome::ExclusiveBusy => Ok(JobRunOutcome::Deferred),
            // Not found runs too: the execution reports the integrity failure
            LockOutcome::Locked(_) | LockOutcome::NotFound => ExecuteAsyncRunnable::new(
                Arc::clone(&self.executor),
                Arc::clone(&self.exception_handlers),
                job_id,
                JobKind::History,
            )
            .run(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use crate::job::{JobHandler, JobRequest, JobTable};
    use crate::context::CommandContext;
    use crate::job::Job;
    use agenda_core::{EngineConfig, EngineError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl JobHandler for Counting {
        fn handler_type(&self) -> &str {
            "count"
        }

        fn execute(&self, _job: &Job, _ctx: &mut CommandContext) -> EngineResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_delivery_runs_the_job_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = ProcessEngine::builder()
            .with_job_handler(Arc::new(Counting(Arc::clone(&runs))))
            .build();
        let job = engine.create_job(JobRequest::new("count")).unwrap();
        let receiver = engine.job_message_receiver();

        assert_eq!(receiver.on_message(&job.id).unwrap(), JobRunOutcome::Executed);
        assert_eq!(receiver.on_message(&job.id).unwrap(), JobRunOutcome::Skipped);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exclusive_job_is_deferred_while_sibling_runs() {
        let engine = ProcessEngine::builder()
            .with_job_handler(Arc::new(Counting(Arc::new(AtomicUsize::new(0)))))
            .build();
        let first = engine
            .create_job(JobRequest::new("count").exclusive_to("instance-1"))
            .unwrap();
        let second = engine
            .create_job(JobRequest::new("count").exclusive_to("instance-1"))
            .unwrap();
        engine
            .command_executor()
            .execute(&LockJobCmd {
                job_id: first.id.clone(),
                lock_owner: "other-node".into(),
            })
            .unwrap();

        let receiver = engine.job_message_receiver();
        assert_eq!(receiver.on_message(&second.id).unwrap(), JobRunOutcome::Deferred);
        assert_eq!(receiver.on_message(&first.id).unwrap(), JobRunOutcome::Deferred);
        assert_eq!(engine.jobs(JobTable::Executable).unwrap().len(), 2);
    }

    #[test]
    fn test_history_receiver_rejects_unknown_ids() {
        let mut config = EngineConfig::default();
        config.history.async_enabled = true;
        let engine = ProcessEngine::builder().with_config(config).build();
        let receiver = engine.history_job_message_receiver();

        let err = receiver.on_message("nope").unwrap_err();
        assert!(matches!(err, EngineError::JobDataIntegrity(_)));
    }
}
