use crate::command::CommandExecutor;
use crate::job::exception::{handle_failure, FailedJob, JobExceptionHandler};
use crate::job::history::ExecuteHistoryJobCmd;
use crate::job::{ExecuteJobCmd, HistoryJobOutcome, JobExecution, JobKind};
use agenda_core::{EngineError, EngineResult};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunOutcome {
    Executed,
    /// History job with entries left for a later run
    Partial { remaining: usize },
    /// The job was gone by the time it ran
    Skipped,
    /// Not run now; the job stays for later
    Deferred,
    /// Failed and handed to the exception handlers
    Failed { message: String },
}

/// Runs one job by id in a fresh command, on a worker thread.
pub struct ExecuteAsyncRunnable {
    executor: Arc<CommandExecutor>,
    exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
    job_id: String,
    kind: JobKind,
}

impl ExecuteAsyncRunnable {
    pub fn new(
        executor: Arc<CommandExecutor>,
        exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
        job_id: impl Into<String>,
        kind: JobKind,
    ) -> Self {
        Self {
            executor,
            exception_handlers,
            job_id: job_id.into(),
            kind,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Errors returned here are not job failures: a history job id that does
    /// not resolve to exactly one history job, or a failure of the exception
    /// handling itself.
    pub fn run(&self) -> EngineResult<JobRunOutcome> {
        let result = match self.kind {
            JobKind::Runtime => self
                .executor
                .execute(&ExecuteJobCmd {
                    job_id: self.job_id.clone(),
                })
                .map(|execution| match execution {
                    JobExecution::Executed => JobRunOutcome::Executed,
                    JobExecution::NotFound => JobRunOutcome::Skipped,
                }),
            JobKind::History => self
                .executor
                .execute(&ExecuteHistoryJobCmd {
                    job_id: self.job_id.clone(),
                })
                .map(|outcome| match outcome {
                    HistoryJobOutcome::Completed => JobRunOutcome::Executed,
                    HistoryJobOutcome::Partial { remaining } => JobRunOutcome::Partial { remaining },
                }),
        };

        match result {
            Ok(outcome) => {
                tracing::debug!("Job {} ran: {:?}", self.job_id, outcome);
                Ok(outcome)
            }
            Err(e @ EngineError::JobDataIntegrity(_)) if self.kind == JobKind::History => {
                tracing::error!("History job {} cannot be executed: {}", self.job_id, e);
                Err(e)
            }
            Err(error) => {
                tracing::warn!("Job {} failed: {}", self.job_id, error);
                let failed = FailedJob {
                    job_id: &self.job_id,
                    kind: self.kind,
                    error: &error,
                };
                handle_failure(&self.exception_handlers, &self.executor, &failed)?;
                Ok(JobRunOutcome::Failed {
                    message: error.to_string(),
                })
            }
        }
    }
}
