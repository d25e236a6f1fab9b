//! Breakpoints on activity entry.
//!
//! When a debugger is installed, the agenda loop asks it before every
//! activity entry. A hit parks the entry as a suspended `breakpoint` job; the
//! process resumes only when that job is continued.

use crate::command::Command;
use crate::context::CommandContext;
use crate::events::EngineEvent;
use crate::job::commands::execute_job;
use crate::job::handler::{JobHandler, BREAKPOINT};
use crate::job::{manager, Job};
use crate::operation::ContinueMode;
use crate::process::Execution;
use agenda_core::{EngineError, EngineResult};
use parking_lot::RwLock;
use std::collections::HashSet;

#[cfg_attr(test, mockall::automock)]
pub trait ProcessDebugger: Send + Sync {
    fn is_breakpoint(&self, execution: &Execution) -> bool;
}

/// Breaks whenever an execution is about to enter one of the listed activities
#[derive(Debug, Default)]
pub struct ActivityBreakpoints {
    activities: RwLock<HashSet<String>>,
}

impl ActivityBreakpoints {
    pub fn new<I, S>(activity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            activities: RwLock::new(activity_ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn add(&self, activity_id: impl Into<String>) {
        self.activities.write().insert(activity_id.into());
    }

    pub fn remove(&self, activity_id: &str) -> bool {
        self.activities.write().remove(activity_id)
    }

    pub fn clear(&self) {
        self.activities.write().clear();
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.activities.read().contains(activity_id)
    }
}

impl ProcessDebugger for ActivityBreakpoints {
    fn is_breakpoint(&self, execution: &Execution) -> bool {
        execution
            .activity_id
            .as_deref()
            .map_or(false, |activity_id| self.contains(activity_id))
    }
}

pub(crate) fn suspend_at_breakpoint(
    ctx: &mut CommandContext,
    execution: &Execution,
) -> EngineResult<String> {
    let job = manager::suspend_breakpoint(ctx, execution)?;
    let activity_id = execution.activity_id.clone().unwrap_or_default();
    tracing::info!(
        "Breakpoint at '{}' for execution {}, suspended as job {}",
        activity_id,
        execution.id,
        job.id
    );
    ctx.emit(EngineEvent::BreakpointHit {
        job_id: job.id.clone(),
        execution_id: execution.id.clone(),
        activity_id,
    });
    Ok(job.id)
}

/// Enters the activity the breakpoint stopped in front of
#[derive(Debug, Default, Clone, Copy)]
pub struct BreakpointJobHandler;

impl JobHandler for BreakpointJobHandler {
    fn handler_type(&self) -> &str {
        BREAKPOINT
    }

    fn execute(&self, job: &Job, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution_id = job.execution_id.as_deref().ok_or_else(|| {
            EngineError::JobDataIntegrity(format!("breakpoint job {} has no execution", job.id))
        })?;
        ctx.agenda()
            .plan_continue_process(execution_id, ContinueMode::PastBreakpoint);
        Ok(())
    }
}

/// Resume a suspended execution. The job is moved and executed in one
/// transaction, so a failure leaves it suspended.
pub struct ContinueFromBreakpointCmd {
    pub job_id: String,
}

impl Command for ContinueFromBreakpointCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let job = manager::move_suspended_to_executable(ctx, &self.job_id, false)?;
        if job.handler_type != BREAKPOINT {
            return Err(EngineError::IllegalState(format!(
                "suspended job {} is a '{}' job, not a breakpoint",
                job.id, job.handler_type
            )));
        }
        execute_job(ctx, &job)
    }

    fn description(&self) -> String {
        format!("Continue from breakpoint {}", self.job_id)
    }
}
