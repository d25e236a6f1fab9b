use super::{HistoryJob, Job};
use crate::context::CommandContext;
use crate::debugger::BreakpointJobHandler;
use crate::operation::ContinueMode;
use crate::process::EXECUTIONS;
use agenda_core::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Arc;

pub const ASYNC_CONTINUATION: &str = "async-continuation";
pub const TRIGGER_TIMER: &str = "trigger-timer";
pub const BREAKPOINT: &str = "breakpoint";
pub const HISTORIC_ACTIVITIES: &str = "historic-activities";

/// Logic behind a job's `handler_type`. Runs inside the command that executes
/// the job; planned operations drain before that command commits.
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    fn execute(&self, job: &Job, ctx: &mut CommandContext) -> EngineResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryJobOutcome {
    /// Payload fully applied; the job is deleted
    Completed,
    /// Part of the payload applied; the job stays for another run
    Partial { remaining: usize },
}

pub trait HistoryJobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    /// Apply (part of) the payload. Applied entries must be removed from `job`.
    fn execute(
        &self,
        job: &mut HistoryJob,
        ctx: &mut CommandContext,
    ) -> EngineResult<HistoryJobOutcome>;
}

#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers the engine itself schedules jobs for
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AsyncContinuationJobHandler));
        registry.register(Arc::new(TriggerTimerJobHandler));
        registry.register(Arc::new(BreakpointJobHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.handler_type().to_string(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

fn execution_of(job: &Job) -> EngineResult<&str> {
    job.execution_id.as_deref().ok_or_else(|| {
        EngineError::JobDataIntegrity(format!(
            "{} job {} has no execution",
            job.handler_type, job.id
        ))
    })
}

/// Enters the activity an execution stopped in front of
#[derive(Debug, Default, Clone, Copy)]
pub struct AsyncContinuationJobHandler;

impl JobHandler for AsyncContinuationJobHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    fn execute(&self, job: &Job, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution_id = execution_of(job)?;
        ctx.agenda().plan_continue_process(execution_id, ContinueMode::Synchronous);
        Ok(())
    }
}

/// Moves an execution out of a timer activity. Configuration is the timer's
/// activity id; a token that already left it is left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct TriggerTimerJobHandler;

impl JobHandler for TriggerTimerJobHandler {
    fn handler_type(&self) -> &str {
        TRIGGER_TIMER
    }

    fn execute(&self, job: &Job, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution_id = execution_of(job)?;
        let Some(execution) = ctx.tx().find(EXECUTIONS, execution_id)? else {
            tracing::debug!("Timer {} fired for vanished execution {}", job.id, execution_id);
            return Ok(());
        };
        if execution.ended || execution.activity_id != job.handler_configuration {
            tracing::debug!(
                "Timer {} is stale, execution {} moved on",
                job.id,
                execution_id
            );
            return Ok(());
        }
        ctx.agenda().plan_trigger_execution(execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_handlers() {
        let registry = JobHandlerRegistry::with_defaults();
        assert_eq!(
            registry.types(),
            vec![ASYNC_CONTINUATION, BREAKPOINT, TRIGGER_TIMER]
        );
        assert!(registry.get("unknown").is_none());
    }
}
