//! Atomic steps of process execution.
//!
//! Operations never call each other directly: whatever comes next is planned
//! on the agenda, so fan-out over parallel flows is breadth-first and the
//! stack stays flat.

use crate::context::CommandContext;
use crate::events::EngineEvent;
use crate::job::history::HistoryEntry;
use crate::job::manager;
use crate::process::{
    self, current_activity, find_definition, find_execution, Activity, ActivityKind, Execution,
    ProcessDefinition, EXECUTIONS,
};
use agenda_core::{EngineError, EngineResult};
use chrono::Duration;
use std::fmt;

/// How [`Operation::ContinueProcess`] treats async activities and breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueMode {
    /// Honour `async_before` and breakpoints
    Default,
    /// Enter the activity now; used when an async continuation job runs
    Synchronous,
    /// Enter the activity now without consulting the debugger
    PastBreakpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Enter the execution's current activity
    ContinueProcess {
        execution_id: String,
        mode: ContinueMode,
    },
    /// Leave the current activity over all of its outgoing flows
    TakeOutgoingFlows { execution_id: String },
    /// Resume an execution stopped in a wait state or timer
    TriggerExecution { execution_id: String },
    /// Remove a token; ends the process instance with the last one
    EndExecution { execution_id: String },
}

impl Operation {
    pub fn execution_id(&self) -> &str {
        match self {
            Operation::ContinueProcess { execution_id, .. }
            | Operation::TakeOutgoingFlows { execution_id }
            | Operation::TriggerExecution { execution_id }
            | Operation::EndExecution { execution_id } => execution_id,
        }
    }

    pub fn execute(self, ctx: &mut CommandContext) -> EngineResult<()> {
        match self {
            Operation::ContinueProcess { execution_id, mode } => {
                continue_process(ctx, &execution_id, mode)
            }
            Operation::TakeOutgoingFlows { execution_id } => take_outgoing_flows(ctx, &execution_id),
            Operation::TriggerExecution { execution_id } => trigger_execution(ctx, &execution_id),
            Operation::EndExecution { execution_id } => end_execution(ctx, &execution_id),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ContinueProcess { execution_id, mode } => {
                write!(f, "ContinueProcess({}, {:?})", execution_id, mode)
            }
            Operation::TakeOutgoingFlows { execution_id } => {
                write!(f, "TakeOutgoingFlows({})", execution_id)
            }
            Operation::TriggerExecution { execution_id } => {
                write!(f, "TriggerExecution({})", execution_id)
            }
            Operation::EndExecution { execution_id } => write!(f, "EndExecution({})", execution_id),
        }
    }
}

fn load(
    ctx: &mut CommandContext,
    execution_id: &str,
) -> EngineResult<(Execution, ProcessDefinition, Activity)> {
    let execution = find_execution(ctx, execution_id)?;
    let definition = find_definition(ctx, &execution.process_definition_id)?;
    let activity = current_activity(&definition, &execution)?.clone();
    Ok((execution, definition, activity))
}

fn continue_process(
    ctx: &mut CommandContext,
    execution_id: &str,
    mode: ContinueMode,
) -> EngineResult<()> {
    let (execution, definition, activity) = load(ctx, execution_id)?;
    if execution.ended {
        tracing::debug!("Execution {} already ended, nothing to continue", execution.id);
        return Ok(());
    }

    if activity.async_before && mode == ContinueMode::Default {
        let job = manager::schedule_async_continuation(ctx, &execution, activity.exclusive)?;
        tracing::debug!(
            "Execution {} continues asynchronously in {} (job {})",
            execution.id,
            activity.id,
            job.id
        );
        return Ok(());
    }

    let now = ctx.now();
    ctx.record_history(HistoryEntry::activity_started(&execution, &activity.id, now));

    match &activity.kind {
        ActivityKind::Start => ctx.agenda().plan_take_outgoing_flows(&execution.id),
        ActivityKind::Task { behavior } => {
            if let Some(name) = behavior {
                let behavior = ctx.services().behaviors.get(name).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "no behavior '{}' registered for activity '{}'",
                        name, activity.id
                    ))
                })?;
                behavior.execute(ctx, &execution)?;
            }
            ctx.agenda().plan_take_outgoing_flows(&execution.id);
        }
        ActivityKind::Wait => {
            tracing::debug!("Execution {} waits in {}", execution.id, activity.id);
        }
        ActivityKind::Timer { duration_secs } => {
            let due = now + Duration::seconds(*duration_secs);
            manager::schedule_timer(ctx, &execution, &activity.id, due)?;
        }
        ActivityKind::Join => join(ctx, execution, &definition, &activity)?,
        ActivityKind::End => ctx.agenda().plan_end_execution(&execution.id),
    }
    Ok(())
}

/// Park the arriving token; once one token arrived per incoming flow, keep
/// the last arrival and drop the others.
fn join(
    ctx: &mut CommandContext,
    mut execution: Execution,
    definition: &ProcessDefinition,
    activity: &Activity,
) -> EngineResult<()> {
    execution.active = false;
    ctx.tx().update(EXECUTIONS, &execution)?;

    let expected = definition.incoming(&activity.id).len();
    let arrived = ctx.tx().query(EXECUTIONS, |e| {
        e.process_instance_id == execution.process_instance_id
            && !e.is_process_instance()
            && !e.active
            && !e.ended
            && e.activity_id.as_deref() == Some(activity.id.as_str())
    })?;
    if arrived.len() < expected {
        tracing::debug!(
            "Join {} has {}/{} executions",
            activity.id,
            arrived.len(),
            expected
        );
        return Ok(());
    }

    for other in arrived
        .iter()
        .filter(|e| e.id != execution.id)
        .take(expected - 1)
    {
        ctx.tx().delete(EXECUTIONS, &other.id)?;
    }
    execution.active = true;
    ctx.tx().update(EXECUTIONS, &execution)?;
    ctx.agenda().plan_take_outgoing_flows(&execution.id);
    Ok(())
}

fn take_outgoing_flows(ctx: &mut CommandContext, execution_id: &str) -> EngineResult<()> {
    let (mut execution, _, activity) = load(ctx, execution_id)?;
    let now = ctx.now();
    ctx.record_history(HistoryEntry::activity_completed(&execution, &activity.id, now));

    let mut targets = activity.outgoing.iter();
    let Some(first) = targets.next() else {
        // No outgoing flow: the token ends here
        ctx.agenda().plan_end_execution(&execution.id);
        return Ok(());
    };

    let mut next = Vec::with_capacity(activity.outgoing.len());
    execution.activity_id = Some(first.clone());
    execution.active = true;
    ctx.tx().update(EXECUTIONS, &execution)?;
    next.push(execution.id.clone());

    for target in targets {
        let child = Execution::child_of(&execution, target, now);
        ctx.tx().insert(EXECUTIONS, &child)?;
        next.push(child.id);
    }

    for id in next {
        ctx.agenda().plan_continue_process(&id, ContinueMode::Default);
    }
    Ok(())
}

fn trigger_execution(ctx: &mut CommandContext, execution_id: &str) -> EngineResult<()> {
    let (execution, _, activity) = load(ctx, execution_id)?;
    if execution.ended {
        return Err(EngineError::IllegalState(format!(
            "execution {} has already ended",
            execution.id
        )));
    }
    match activity.kind {
        ActivityKind::Wait => {}
        ActivityKind::Timer { .. } => {
            // Triggered early: the pending timer must not fire a second time
            manager::delete_timers_for_execution(ctx, &execution.id)?;
        }
        _ => {
            return Err(EngineError::IllegalState(format!(
                "execution {} is not waiting (activity '{}')",
                execution.id, activity.id
            )))
        }
    }
    ctx.agenda().plan_take_outgoing_flows(&execution.id);
    Ok(())
}

fn end_execution(ctx: &mut CommandContext, execution_id: &str) -> EngineResult<()> {
    let execution = find_execution(ctx, execution_id)?;
    let now = ctx.now();

    if !execution.is_process_instance() {
        ctx.tx().delete(EXECUTIONS, &execution.id)?;
        let remaining = process::active_children(ctx, &execution.process_instance_id)?;
        if !remaining.is_empty() {
            tracing::debug!(
                "Execution {} ended, {} more in {}",
                execution.id,
                remaining.len(),
                execution.process_instance_id
            );
            return Ok(());
        }
    }

    let mut instance = find_execution(ctx, &execution.process_instance_id)?;
    if instance.ended {
        return Ok(());
    }
    instance.active = false;
    instance.ended = true;
    instance.ended_at = Some(now);
    instance.activity_id = execution.activity_id.clone();
    ctx.tx().update(EXECUTIONS, &instance)?;

    ctx.record_history(HistoryEntry::process_completed(&instance, now));
    ctx.emit(EngineEvent::ProcessCompleted {
        process_instance_id: instance.id.clone(),
    });
    tracing::info!("Process instance {} completed", instance.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use crate::job::JobTable;
    use crate::process::ProcessBuilder;
    use crate::Command;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn deploy(engine: &ProcessEngine, definition: ProcessDefinition) {
        engine.deploy(definition).unwrap();
    }

    fn tokens(engine: &ProcessEngine, instance: &str) -> Vec<Execution> {
        engine
            .executions(instance)
            .unwrap()
            .into_iter()
            .filter(|e| !e.is_process_instance())
            .collect()
    }

    #[test]
    fn test_linear_process_runs_to_completion() {
        let engine = ProcessEngine::builder().build();
        deploy(
            &engine,
            ProcessBuilder::new("linear")
                .activity(Activity::start("start").to("a"))
                .activity(Activity::task("a").to("b"))
                .activity(Activity::task("b").to("end"))
                .activity(Activity::end("end"))
                .build(),
        );

        let instance = engine.start_process("linear", BTreeMap::new()).unwrap();
        let instance = engine.process_instance(&instance.id).unwrap().unwrap();
        assert!(instance.ended);
        assert_eq!(instance.activity_id.as_deref(), Some("end"));
        assert!(tokens(&engine, &instance.id).is_empty());
    }

    #[test]
    fn test_fan_out_is_breadth_first() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = |name: &'static str, order: Arc<parking_lot::Mutex<Vec<&'static str>>>| {
            Arc::new(
                move |_: &mut CommandContext, _: &Execution| -> EngineResult<()> {
                    order.lock().push(name);
                    Ok(())
                },
            )
        };
        let engine = ProcessEngine::builder()
            .with_behavior("a1", record("a1", Arc::clone(&order)))
            .with_behavior("a2", record("a2", Arc::clone(&order)))
            .with_behavior("b1", record("b1", Arc::clone(&order)))
            .with_behavior("b2", record("b2", Arc::clone(&order)))
            .build();
        deploy(
            &engine,
            ProcessBuilder::new("fork")
                .activity(Activity::start("start").to("a1").to("b1"))
                .activity(Activity::service("a1", "a1").to("a2"))
                .activity(Activity::service("a2", "a2").to("join"))
                .activity(Activity::service("b1", "b1").to("b2"))
                .activity(Activity::service("b2", "b2").to("join"))
                .activity(Activity::join("join").to("end"))
                .activity(Activity::end("end"))
                .build(),
        );

        let instance = engine.start_process("fork", BTreeMap::new()).unwrap();
        assert_eq!(*order.lock(), vec!["a1", "b1", "a2", "b2"]);
        assert!(engine.process_instance(&instance.id).unwrap().unwrap().ended);
    }

    #[test]
    fn test_join_waits_for_every_branch() {
        let engine = ProcessEngine::builder().build();
        deploy(
            &engine,
            ProcessBuilder::new("approval")
                .activity(Activity::start("start").to("legal").to("finance"))
                .activity(Activity::wait("legal").to("join"))
                .activity(Activity::wait("finance").to("join"))
                .activity(Activity::join("join").to("end"))
                .activity(Activity::end("end"))
                .build(),
        );
        let instance = engine.start_process("approval", BTreeMap::new()).unwrap();

        let waiting = tokens(&engine, &instance.id);
        assert_eq!(waiting.len(), 2);
        let legal = waiting
            .iter()
            .find(|e| e.activity_id.as_deref() == Some("legal"))
            .unwrap();
        engine.trigger(&legal.id).unwrap();

        let after_first = tokens(&engine, &instance.id);
        assert_eq!(after_first.len(), 2);
        assert!(after_first
            .iter()
            .any(|e| e.activity_id.as_deref() == Some("join") && !e.active));
        assert!(!engine.process_instance(&instance.id).unwrap().unwrap().ended);

        let finance = after_first
            .iter()
            .find(|e| e.activity_id.as_deref() == Some("finance"))
            .unwrap();
        engine.trigger(&finance.id).unwrap();
        assert!(engine.process_instance(&instance.id).unwrap().unwrap().ended);
        assert!(tokens(&engine, &instance.id).is_empty());
    }

    #[test]
    fn test_trigger_rejects_execution_that_is_not_waiting() {
        let engine = ProcessEngine::builder().build();
        deploy(
            &engine,
            ProcessBuilder::new("timer")
                .activity(Activity::start("start").to("pause"))
                .activity(Activity::timer("pause", 60).to("end"))
                .activity(Activity::end("end"))
                .build(),
        );
        let instance = engine.start_process("timer", BTreeMap::new()).unwrap();
        let token = tokens(&engine, &instance.id).remove(0);
        assert_eq!(token.activity_id.as_deref(), Some("pause"));
        assert_eq!(engine.jobs(JobTable::Timer).unwrap().len(), 1);

        // Triggering the timer early removes its job
        engine.trigger(&token.id).unwrap();
        assert!(engine.jobs(JobTable::Timer).unwrap().is_empty());
        assert!(engine.process_instance(&instance.id).unwrap().unwrap().ended);

        // An ended instance cannot be triggered
        assert!(matches!(
            engine.trigger(&instance.id),
            Err(EngineError::IllegalState(_))
        ));
    }

    #[test]
    fn test_failing_behavior_rolls_back_the_whole_command() {
        let engine = ProcessEngine::builder().build();
        deploy(
            &engine,
            ProcessBuilder::new("doomed")
                .activity(Activity::start("start").to("boom"))
                .activity(Activity::service("boom", "fail").to("end"))
                .activity(Activity::end("end"))
                .build(),
        );
        let err = engine.start_process("doomed", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        struct CountExecutions;
        impl Command for CountExecutions {
            type Output = usize;
            fn execute(&self, ctx: &mut CommandContext) -> EngineResult<usize> {
                Ok(ctx.tx().query(EXECUTIONS, |_| true)?.len())
            }
            fn description(&self) -> String {
                "Count executions".to_string()
            }
        }
        assert_eq!(
            engine.command_executor().execute(&CountExecutions).unwrap(),
            0
        );
    }

    #[test]
    fn test_behavior_can_set_variables() {
        let engine = ProcessEngine::builder()
            .with_behavior(
                "approve",
                Arc::new(|ctx: &mut CommandContext, execution: &Execution| {
                    process::set_variable(ctx, execution, "approved", serde_json::json!(true))
                }),
            )
            .build();
        deploy(
            &engine,
            ProcessBuilder::new("vars")
                .activity(Activity::start("start").to("approve"))
                .activity(Activity::service("approve", "approve").to("hold"))
                .activity(Activity::wait("hold").to("end"))
                .activity(Activity::end("end"))
                .build(),
        );
        let mut variables = BTreeMap::new();
        variables.insert("amount".to_string(), serde_json::json!(42));
        let instance = engine.start_process("vars", variables).unwrap();

        let instance = engine.process_instance(&instance.id).unwrap().unwrap();
        assert_eq!(instance.variables["amount"], 42);
        assert_eq!(instance.variables["approved"], true);
    }
}
