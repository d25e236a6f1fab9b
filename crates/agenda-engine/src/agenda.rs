//! FIFO queue of pending operations and the loop that drains it.

use crate::context::CommandContext;
use crate::debugger;
use crate::operation::{ContinueMode, Operation};
use crate::process::{self, Execution};
use agenda_core::EngineResult;
use std::collections::{HashSet, VecDeque};

/// Pending operations of one [`CommandContext`]. Operations are consumed as
/// they are handed out, so none can run twice.
#[derive(Debug, Default)]
pub struct Agenda {
    operations: VecDeque<Operation>,
    involved: Vec<String>,
    involved_ids: HashSet<String>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn next_operation(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }

    pub fn plan_operation(&mut self, operation: Operation) {
        tracing::trace!("Planned {}", operation);
        self.operations.push_back(operation);
    }

    /// Plan an operation and mark `execution_id` as involved in this transaction
    pub fn plan_operation_for(&mut self, operation: Operation, execution_id: &str) {
        if self.involved_ids.insert(execution_id.to_string()) {
            self.involved.push(execution_id.to_string());
        }
        self.plan_operation(operation);
    }

    pub fn plan_continue_process(&mut self, execution_id: &str, mode: ContinueMode) {
        self.plan_operation_for(
            Operation::ContinueProcess {
                execution_id: execution_id.to_string(),
                mode,
            },
            execution_id,
        );
    }

    pub fn plan_take_outgoing_flows(&mut self, execution_id: &str) {
        self.plan_operation_for(
            Operation::TakeOutgoingFlows {
                execution_id: execution_id.to_string(),
            },
            execution_id,
        );
    }

    pub fn plan_trigger_execution(&mut self, execution_id: &str) {
        self.plan_operation_for(
            Operation::TriggerExecution {
                execution_id: execution_id.to_string(),
            },
            execution_id,
        );
    }

    pub fn plan_end_execution(&mut self, execution_id: &str) {
        self.plan_operation_for(
            Operation::EndExecution {
                execution_id: execution_id.to_string(),
            },
            execution_id,
        );
    }

    pub fn involved_executions(&self) -> &[String] {
        &self.involved
    }
}

/// What happened to one operation taken from the agenda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    /// A breakpoint matched; the operation was parked as a suspended job
    Suspended { job_id: String },
}

/// Summary of one drain of the agenda.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgendaReport {
    pub executed: usize,
    pub suspended: Vec<String>,
}

impl AgendaReport {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Executed => self.executed += 1,
            StepOutcome::Suspended { job_id } => self.suspended.push(job_id),
        }
    }
}

impl CommandContext {
    /// Execute operations until the agenda is empty. Operations planned while
    /// draining run in the same loop, in FIFO order.
    pub fn run_agenda(&mut self) -> EngineResult<AgendaReport> {
        let mut report = AgendaReport::default();
        while let Some(operation) = self.agenda().next_operation() {
            let outcome = self.step(operation)?;
            report.record(outcome);
        }
        if report.executed > 0 || !report.suspended.is_empty() {
            tracing::debug!(
                "Agenda drained: {} executed, {} suspended",
                report.executed,
                report.suspended.len()
            );
        }
        Ok(report)
    }

    fn step(&mut self, operation: Operation) -> EngineResult<StepOutcome> {
        if let Some(execution) = self.breakpoint_hit(&operation)? {
            let job_id = debugger::suspend_at_breakpoint(self, &execution)?;
            return Ok(StepOutcome::Suspended { job_id });
        }
        tracing::debug!("Executing {}", operation);
        operation.execute(self)?;
        Ok(StepOutcome::Executed)
    }

    /// Entering an activity is the only point a breakpoint can stop at
    fn breakpoint_hit(&mut self, operation: &Operation) -> EngineResult<Option<Execution>> {
        let Some(debugger) = self.services().debugger.clone() else {
            return Ok(None);
        };
        let execution_id = match operation {
            Operation::ContinueProcess { execution_id, mode }
                if *mode != ContinueMode::PastBreakpoint =>
            {
                execution_id
            }
            _ => return Ok(None),
        };
        let execution = process::find_execution(self, execution_id)?;
        if debugger.is_breakpoint(&execution) {
            Ok(Some(execution))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continue_op(id: &str) -> Operation {
        Operation::ContinueProcess {
            execution_id: id.to_string(),
            mode: ContinueMode::Default,
        }
    }

    #[test]
    fn test_operations_come_out_in_plan_order() {
        let mut agenda = Agenda::new();
        assert!(agenda.is_empty());
        agenda.plan_operation(continue_op("a"));
        agenda.plan_take_outgoing_flows("b");
        agenda.plan_end_execution("c");
        assert_eq!(agenda.len(), 3);

        assert_eq!(agenda.next_operation(), Some(continue_op("a")));
        assert!(matches!(
            agenda.next_operation(),
            Some(Operation::TakeOutgoingFlows { execution_id }) if execution_id == "b"
        ));
        assert!(matches!(
            agenda.next_operation(),
            Some(Operation::EndExecution { .. })
        ));
        assert_eq!(agenda.next_operation(), None);
        assert!(agenda.is_empty());
    }

    #[test]
    fn test_involved_executions_are_deduplicated() {
        let mut agenda = Agenda::new();
        agenda.plan_continue_process("e1", ContinueMode::Default);
        agenda.plan_take_outgoing_flows("e2");
        agenda.plan_trigger_execution("e1");
        // Unrelated operation does not register anything
        agenda.plan_operation(continue_op("e3"));

        assert_eq!(agenda.involved_executions(), ["e1", "e2"]);
        assert_eq!(agenda.len(), 4);
    }
}
