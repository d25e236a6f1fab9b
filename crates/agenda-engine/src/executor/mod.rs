//! Background execution of persisted jobs.
//!
//! The executor either polls the job tables or, in message-queue mode,
//! consumes job ids from a [`MessageTransport`]. Due timers are always found
//! by polling. Each job runs in its own blocking task, at most
//! `max_concurrent_jobs` at a time.

mod receiver;
mod runnable;
mod transport;

pub use receiver::{AsyncHistoryJobMessageReceiver, JobMessageReceiver};
pub use runnable::{ExecuteAsyncRunnable, JobRunOutcome};
pub use transport::{Destination, InMemoryTransport, MessageTransport};

use crate::command::CommandExecutor;
use crate::job::exception::{default_exception_handlers, JobExceptionHandler};
use crate::job::history::{AcquireHistoryJobsCmd, UnacquireHistoryJobCmd};
use crate::job::{AcquireJobsCmd, AcquireTimerJobsCmd, JobKind, UnacquireJobCmd};
use crate::Command;
use agenda_core::{AsyncExecutorConfig, EngineError, EngineResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Totals of one [`AsyncExecutor::run_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub timers_moved: usize,
    pub executed: usize,
    pub history_executed: usize,
    pub partial: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    fn record(&mut self, kind: JobKind, outcome: &JobRunOutcome) {
        match outcome {
            JobRunOutcome::Executed if kind == JobKind::History => self.history_executed += 1,
            JobRunOutcome::Executed => self.executed += 1,
            JobRunOutcome::Partial { .. } => self.partial += 1,
            JobRunOutcome::Skipped | JobRunOutcome::Deferred => self.skipped += 1,
            JobRunOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct AsyncExecutor {
    executor: Arc<CommandExecutor>,
    transport: Option<Arc<dyn MessageTransport>>,
    exception_handlers: Arc<Vec<Arc<dyn JobExceptionHandler>>>,
    lock_owner: String,
    config: AsyncExecutorConfig,
}

impl AsyncExecutor {
    pub fn new(executor: Arc<CommandExecutor>, lock_owner: impl Into<String>) -> Self {
        let services = executor.services();
        let config = services.config.async_executor.clone();
        let transport = services.transport.clone();
        Self {
            executor,
            transport,
            exception_handlers: Arc::new(default_exception_handlers()),
            lock_owner: lock_owner.into(),
            config,
        }
    }

    /// Handlers consulted before the default ones
    pub fn with_exception_handler(mut self, handler: Arc<dyn JobExceptionHandler>) -> Self {
        let mut handlers = vec![handler];
        handlers.extend(self.exception_handlers.iter().cloned());
        self.exception_handlers = Arc::new(handlers);
        self
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    pub fn job_message_receiver(&self) -> JobMessageReceiver {
        JobMessageReceiver::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.exception_handlers),
            self.lock_owner.clone(),
        )
    }

    pub fn history_job_message_receiver(&self) -> AsyncHistoryJobMessageReceiver {
        AsyncHistoryJobMessageReceiver::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.exception_handlers),
            self.lock_owner.clone(),
        )
    }

    fn message_mode(&self) -> Option<Arc<dyn MessageTransport>> {
        if self.config.message_queue_mode {
            self.transport.clone()
        } else {
            None
        }
    }

    fn runnable(&self, job_id: String, kind: JobKind) -> ExecuteAsyncRunnable {
        ExecuteAsyncRunnable::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.exception_handlers),
            job_id,
            kind,
        )
    }

    /// One synchronous pass: move due timers, then acquire and run executable
    /// jobs and history jobs until none are left. Used by the CLI and tests.
    ///
    /// Each job runs at most once per pass; a job that comes back after a
    /// failure is given back and left for the next pass. Partial history jobs
    /// are the exception and continue until done.
    pub async fn run_once(&self) -> EngineResult<RunReport> {
        let mut report = RunReport::default();
        let timers = execute_blocking(
            &self.executor,
            AcquireTimerJobsCmd {
                max_jobs: self.config.max_timer_jobs_per_acquisition,
            },
        )
        .await?;
        report.timers_moved = timers.len();

        let mut attempted = HashSet::new();
        loop {
            let jobs = execute_blocking(
                &self.executor,
                AcquireJobsCmd {
                    lock_owner: self.lock_owner.clone(),
                    max_jobs: self.config.max_jobs_per_acquisition,
                },
            )
            .await?;
            let history_jobs = execute_blocking(
                &self.executor,
                AcquireHistoryJobsCmd {
                    lock_owner: self.lock_owner.clone(),
                    max_jobs: self.config.max_jobs_per_acquisition,
                },
            )
            .await?;

            let (fresh, repeated): (Vec<_>, Vec<_>) = jobs
                .into_iter()
                .map(|job| (job.id, JobKind::Runtime))
                .chain(history_jobs.into_iter().map(|job| (job.id, JobKind::History)))
                .partition(|(job_id, _)| !attempted.contains(job_id));
            for (job_id, kind) in repeated {
                tracing::debug!("Job {} already ran in this pass, leaving it", job_id);
                self.unacquire(kind, job_id).await;
            }
            if fresh.is_empty() {
                break;
            }

            let mut pending = fresh.into_iter();
            while let Some((job_id, kind)) = pending.next() {
                attempted.insert(job_id.clone());
                let runnable = self.runnable(job_id.clone(), kind);
                let result = tokio::task::spawn_blocking(move || runnable.run())
                    .await
                    .map_err(|e| EngineError::Internal(format!("job worker panicked: {}", e)))
                    .and_then(|result| result);
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        for (job_id, kind) in pending {
                            self.unacquire(kind, job_id).await;
                        }
                        return Err(e);
                    }
                };
                if matches!(outcome, JobRunOutcome::Partial { .. }) {
                    attempted.remove(&job_id);
                }
                report.record(kind, &outcome);
            }
        }

        if report != RunReport::default() {
            tracing::info!("Executor pass finished: {:?}", report);
        }
        Ok(report)
    }

    /// Start the background loops. They run until the handle is shut down.
    pub fn start(self: &Arc<Self>) -> AsyncExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = self.config.max_concurrent_jobs.max(1);
        let workers = Arc::new(Semaphore::new(permits));
        let mut loops = vec![tokio::spawn(
            Arc::clone(self).timer_loop(shutdown_rx.clone()),
        )];

        match self.message_mode() {
            Some(transport) => {
                tracing::info!("Async executor {} started in message-queue mode", self.lock_owner);
                for destination in [Destination::Jobs, Destination::HistoryJobs] {
                    loops.push(tokio::spawn(Arc::clone(self).message_loop(
                        Arc::clone(&transport),
                        destination,
                        Arc::clone(&workers),
                        shutdown_rx.clone(),
                    )));
                }
            }
            None => {
                tracing::info!("Async executor {} started in polling mode", self.lock_owner);
                loops.push(tokio::spawn(Arc::clone(self).acquisition_loop(
                    Arc::clone(&workers),
                    shutdown_rx.clone(),
                )));
            }
        }

        AsyncExecutorHandle {
            shutdown_tx,
            loops,
            workers,
            permits,
            shutdown_timeout: self.config.shutdown_timeout(),
        }
    }

    async fn timer_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let wait = self.config.timer_acquire_wait();
        loop {
            let command = AcquireTimerJobsCmd {
                max_jobs: self.config.max_timer_jobs_per_acquisition,
            };
            if let Err(e) = execute_blocking(&self.executor, command).await {
                tracing::warn!("Timer acquisition failed: {}", e);
            }
            if wait_or_shutdown(&mut shutdown, wait).await {
                break;
            }
        }
        tracing::debug!("Timer loop stopped");
    }

    async fn acquisition_loop(
        self: Arc<Self>,
        workers: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let wait = self.config.acquire_wait();
        loop {
            let free = workers.available_permits();
            if free > 0 {
                let max_jobs = free.min(self.config.max_jobs_per_acquisition);
                self.acquire_and_submit(JobKind::Runtime, max_jobs, &workers)
                    .await;
                self.acquire_and_submit(JobKind::History, max_jobs, &workers)
                    .await;
            }
            if wait_or_shutdown(&mut shutdown, wait).await {
                break;
            }
        }
        tracing::debug!("Acquisition loop stopped");
    }

    async fn acquire_and_submit(&self, kind: JobKind, max_jobs: usize, workers: &Arc<Semaphore>) {
        let lock_owner = self.lock_owner.clone();
        let acquired = match kind {
            JobKind::Runtime => {
                let command = AcquireJobsCmd {
                    lock_owner,
                    max_jobs,
                };
                execute_blocking(&self.executor, command)
                    .await
                    .map(|jobs| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>())
            }
            JobKind::History => {
                let command = AcquireHistoryJobsCmd {
                    lock_owner,
                    max_jobs,
                };
                execute_blocking(&self.executor, command)
                    .await
                    .map(|jobs| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>())
            }
        };
        let job_ids = match acquired {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("{:?} job acquisition failed: {}", kind, e);
                return;
            }
        };
        if !job_ids.is_empty() {
            tracing::info!("Acquired {} {:?} jobs", job_ids.len(), kind);
        }

        for job_id in job_ids {
            let Ok(permit) = Arc::clone(workers).try_acquire_owned() else {
                tracing::debug!("No worker free for job {}, unacquiring", job_id);
                self.unacquire(kind, job_id).await;
                continue;
            };
            let runnable = self.runnable(job_id, kind);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = runnable.run() {
                    tracing::error!("Job {} could not be executed: {}", runnable.job_id(), e);
                }
                drop(permit);
            });
        }
    }

    /// Give an acquired job back so it can be acquired again
    async fn unacquire(&self, kind: JobKind, job_id: String) {
        let result = match kind {
            JobKind::Runtime => execute_blocking(&self.executor, UnacquireJobCmd { job_id })
                .await
                .map(|_| ()),
            JobKind::History => execute_blocking(&self.executor, UnacquireHistoryJobCmd { job_id })
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!("Unacquiring {:?} job failed: {}", kind, e);
        }
    }

    async fn message_loop(
        self: Arc<Self>,
        transport: Arc<dyn MessageTransport>,
        destination: Destination,
        workers: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let redelivery = self.config.acquire_wait();
        loop {
            let job_id = tokio::select! {
                _ = shutdown.changed() => break,
                received = transport.receive(destination) => match received {
                    Some(job_id) => job_id,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job_receiver = self.job_message_receiver();
            let history_receiver = self.history_job_message_receiver();
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let id = job_id.clone();
                let result = tokio::task::spawn_blocking(move || match destination {
                    Destination::Jobs => job_receiver.on_message(&id),
                    Destination::HistoryJobs => history_receiver.on_message(&id),
                })
                .await;
                drop(permit);
                match result {
                    Ok(Ok(JobRunOutcome::Deferred)) => {
                        tokio::time::sleep(redelivery).await;
                        if let Err(e) = transport.send(destination, &job_id) {
                            tracing::warn!("Redelivery of job {} failed: {}", job_id, e);
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!("Message for job {} failed: {}", job_id, e),
                    Err(e) => tracing::error!("Worker for job {} panicked: {}", job_id, e),
                }
            });
        }
        tracing::debug!("Message loop for {} stopped", destination);
    }
}

impl std::fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("lock_owner", &self.lock_owner)
            .field("message_queue_mode", &self.config.message_queue_mode)
            .field("exception_handlers", &self.exception_handlers.len())
            .finish()
    }
}

/// Handle on a started [`AsyncExecutor`]
pub struct AsyncExecutorHandle {
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    workers: Arc<Semaphore>,
    permits: usize,
    shutdown_timeout: Duration,
}

impl AsyncExecutorHandle {
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && self.loops.iter().any(|l| !l.is_finished())
    }

    /// Stop acquiring and wait for running jobs, up to the shutdown timeout
    pub async fn shutdown(self) -> EngineResult<()> {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.loops).await {
            if let Err(e) = result {
                tracing::warn!("Executor loop ended abnormally: {}", e);
            }
        }
        let permits = u32::try_from(self.permits).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.shutdown_timeout, self.workers.acquire_many(permits)).await {
            Ok(_) => {
                tracing::info!("Async executor stopped");
                Ok(())
            }
            Err(_) => Err(EngineError::IllegalState(format!(
                "jobs still running after {:?}",
                self.shutdown_timeout
            ))),
        }
    }
}

/// Sleep for `wait`; true when shutdown was requested meanwhile
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
    }
}

async fn execute_blocking<C>(executor: &Arc<CommandExecutor>, command: C) -> EngineResult<C::Output>
where
    C: Command + 'static,
    C::Output: Send + 'static,
{
    let executor = Arc::clone(executor);
    tokio::task::spawn_blocking(move || executor.execute(&command))
        .await
        .map_err(|e| EngineError::Internal(format!("command worker panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::ActivityBreakpoints;
    use crate::engine::ProcessEngine;
    use crate::context::CommandContext;
    use crate::job::exception::FailedJob;
    use crate::job::handler::JobHandler;
    use crate::job::{Job, JobRequest, JobTable, MoveSuspendedJobToExecutableCmd, JOBS};
    use crate::process::{Activity, ProcessBuilder, ProcessDefinition};
    use agenda_core::{EngineConfig, ManualClock};
    use std::collections::BTreeMap;

    fn async_process() -> ProcessDefinition {
        ProcessBuilder::new("async")
            .activity(Activity::start("start").to("work"))
            .activity(Activity::service("work", "log").asynchronous().to("end"))
            .activity(Activity::end("end"))
            .build()
    }

    #[tokio::test]
    async fn test_run_once_completes_async_continuation() {
        let engine = ProcessEngine::builder().build();
        engine.deploy(async_process()).unwrap();
        let instance = engine.start_process("async", BTreeMap::new()).unwrap();

        assert_eq!(engine.jobs(JobTable::Executable).unwrap().len(), 1);
        assert!(!engine.process_instance(&instance.id).unwrap().unwrap().ended);

        let report = engine.async_executor().run_once().await.unwrap();
        assert_eq!(report.executed, 1);
        assert!(report.history_executed >= 1);
        assert!(engine.process_instance(&instance.id).unwrap().unwrap().ended);
        assert!(engine.jobs(JobTable::Executable).unwrap().is_empty());
        assert!(engine.history_jobs().unwrap().is_empty());
        assert!(!engine
            .historic_activities(Some(&instance.id))
            .unwrap()
            .is_empty());
    }

    /// Touches its own job row from another transaction, so every attempt
    /// loses the commit race
    struct AlwaysConflicting;

    impl JobHandler for AlwaysConflicting {
        fn handler_type(&self) -> &str {
            "conflicting"
        }

        fn execute(&self, job: &Job, ctx: &mut CommandContext) -> EngineResult<()> {
            let store = Arc::clone(ctx.tx().store());
            let mut other = store.begin();
            if let Some(row) = other.find(JOBS, &job.id)? {
                other.update(JOBS, &row)?;
                other.commit()?;
            }
            Ok(())
        }
    }

    struct Noop;

    impl JobHandler for Noop {
        fn handler_type(&self) -> &str {
            "noop"
        }

        fn execute(&self, _job: &Job, _ctx: &mut CommandContext) -> EngineResult<()> {
            Ok(())
        }
    }

    /// Stands in for an exception handler whose own storage is down
    struct BrokenExceptionHandler;

    impl JobExceptionHandler for BrokenExceptionHandler {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn handle(&self, _executor: &CommandExecutor, failed: &FailedJob<'_>) -> EngineResult<bool> {
            Err(EngineError::Persistence(format!(
                "cannot record failure of {}",
                failed.job_id
            )))
        }
    }

    #[tokio::test]
    async fn test_run_once_gives_back_job_that_keeps_conflicting() {
        let mut config = EngineConfig::default();
        config.retry.max_retries = 0;
        let engine = ProcessEngine::builder()
            .with_config(config)
            .with_job_handler(Arc::new(AlwaysConflicting))
            .build();
        let job = engine
            .create_job(JobRequest::new("conflicting"))
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), engine.async_executor().run_once())
            .await
            .expect("run_once kept re-running the conflicting job")
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.executed, 0);

        let left = engine.jobs(JobTable::Executable).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, job.id);
        assert_eq!(left[0].retries, job.retries);
        assert!(left[0].lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_run_once_error_unacquires_jobs_not_yet_run() {
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder()
            .with_clock(clock.clone())
            .with_job_handler(Arc::new(Noop))
            .build();
        let failing = engine.create_job(JobRequest::new("unregistered")).unwrap();
        let mut waiting = Vec::new();
        for _ in 0..2 {
            clock.advance(chrono::Duration::seconds(1));
            waiting.push(engine.create_job(JobRequest::new("noop")).unwrap().id);
        }

        let executor = AsyncExecutor::new(Arc::clone(engine.command_executor()), "node-1")
            .with_exception_handler(Arc::new(BrokenExceptionHandler));
        let err = executor.run_once().await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));

        let jobs = engine.jobs(JobTable::Executable).unwrap();
        assert_eq!(jobs.len(), 3);
        for job in &jobs {
            if job.id == failing.id {
                assert_eq!(job.lock_owner.as_deref(), Some("node-1"));
            } else {
                assert!(waiting.contains(&job.id));
                assert!(job.lock_owner.is_none(), "job {} left locked", job.id);
            }
        }
    }

    #[tokio::test]
    async fn test_failing_breakpoint_job_returns_to_suspended() {
        let engine = ProcessEngine::builder()
            .with_debugger(Arc::new(ActivityBreakpoints::new(["work"])))
            .build();
        engine
            .deploy(
                ProcessBuilder::new("broken")
                    .activity(Activity::start("start").to("work"))
                    .activity(Activity::service("work", "fail").to("end"))
                    .activity(Activity::end("end"))
                    .build(),
            )
            .unwrap();
        engine.start_process("broken", BTreeMap::new()).unwrap();
        let job = engine.jobs(JobTable::Suspended).unwrap().remove(0);
        engine
            .command_executor()
            .execute(&MoveSuspendedJobToExecutableCmd {
                job_id: job.id.clone(),
            })
            .unwrap();

        let report = engine.async_executor().run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        let suspended = engine.jobs(JobTable::Suspended).unwrap();
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].id, job.id);
        assert_eq!(suspended[0].retries, job.retries);
    }

    #[tokio::test]
    async fn test_message_queue_mode_runs_jobs_after_commit() {
        let mut config = EngineConfig::default();
        config.async_executor.message_queue_mode = true;
        config.async_executor.timer_acquire_wait_ms = 20;
        config.async_executor.acquire_wait_ms = 20;
        config.async_executor.shutdown_timeout_ms = 2_000;
        let engine = ProcessEngine::builder()
            .with_config(config)
            .with_transport(Arc::new(InMemoryTransport::new()))
            .build();
        engine.deploy(async_process()).unwrap();

        let handle = engine.async_executor().start();
        assert!(handle.is_running());
        let instance = engine.start_process("async", BTreeMap::new()).unwrap();

        let mut ended = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if engine.process_instance(&instance.id).unwrap().unwrap().ended
                && engine.history_jobs().unwrap().is_empty()
            {
                ended = true;
                break;
            }
        }
        handle.shutdown().await.unwrap();
        assert!(ended, "process did not complete through the message queue");
        assert!(engine.jobs(JobTable::Executable).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_polling_mode_runs_jobs_in_background() {
        let mut config = EngineConfig::default();
        config.async_executor.acquire_wait_ms = 10;
        config.async_executor.timer_acquire_wait_ms = 10;
        let engine = ProcessEngine::builder().with_config(config).build();
        engine.deploy(async_process()).unwrap();
        let handle = engine.async_executor().start();

        let instances: Vec<_> = (0..5)
            .map(|_| engine.start_process("async", BTreeMap::new()).unwrap())
            .collect();

        let mut remaining = instances.len();
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = instances
                .iter()
                .filter(|i| !engine.process_instance(&i.id).unwrap().unwrap().ended)
                .count();
            if remaining == 0 {
                break;
            }
        }
        handle.shutdown().await.unwrap();
        assert_eq!(remaining, 0);
    }
}
