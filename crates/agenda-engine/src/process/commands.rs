use super::{
    find_execution, latest_definition, Execution, ProcessDefinition, EXECUTIONS,
    PROCESS_DEFINITIONS,
};
use crate::command::Command;
use crate::context::CommandContext;
use crate::events::EngineEvent;
use crate::job::history::HistoryEntry;
use crate::operation::ContinueMode;
use agenda_core::{EngineError, EngineResult};
use std::collections::BTreeMap;

/// Store a new version of a process definition
pub struct DeployCmd {
    pub definition: ProcessDefinition,
}

impl Command for DeployCmd {
    type Output = ProcessDefinition;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<ProcessDefinition> {
        self.definition.validate()?;
        let version = latest_definition(ctx, &self.definition.key)?
            .map_or(1, |latest| latest.version + 1);

        let mut definition = self.definition.clone();
        definition.version = version;
        definition.id = format!("{}:{}", definition.key, version);
        definition.deployed_at = Some(ctx.now());
        ctx.tx().insert(PROCESS_DEFINITIONS, &definition)?;

        tracing::info!("Deployed process definition {}", definition.id);
        ctx.emit(EngineEvent::ProcessDeployed {
            definition_id: definition.id.clone(),
        });
        Ok(definition)
    }

    fn description(&self) -> String {
        format!("Deploy process '{}'", self.definition.key)
    }
}

/// Start a process instance of the latest version of a definition.
/// Returns the process instance as created; the agenda has not run yet.
pub struct StartProcessCmd {
    pub key: String,
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl Command for StartProcessCmd {
    type Output = Execution;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Execution> {
        let definition = latest_definition(ctx, &self.key)?
            .ok_or_else(|| EngineError::NotFound(format!("process definition '{}'", self.key)))?;
        let initial = definition.initial_activity()?.id.clone();
        let now = ctx.now();

        let instance = Execution::new_process_instance(&definition, self.variables.clone(), now);
        let token = Execution::child_of(&instance, &initial, now);
        ctx.tx().insert(EXECUTIONS, &instance)?;
        ctx.tx().insert(EXECUTIONS, &token)?;

        ctx.record_history(HistoryEntry::process_started(&instance, now));
        ctx.emit(EngineEvent::ProcessStarted {
            process_instance_id: instance.id.clone(),
            definition_id: definition.id.clone(),
        });
        ctx.agenda().plan_continue_process(&token.id, ContinueMode::Default);
        Ok(instance)
    }

    fn description(&self) -> String {
        format!("Start process '{}'", self.key)
    }
}

/// Signal an execution waiting in a wait state or timer to move on
pub struct TriggerExecutionCmd {
    pub execution_id: String,
}

impl Command for TriggerExecutionCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = find_execution(ctx, &self.execution_id)?;
        ctx.agenda().plan_trigger_execution(&execution.id);
        Ok(())
    }

    fn description(&self) -> String {
        format!("Trigger execution {}", self.execution_id)
    }
}

pub struct GetExecutionCmd {
    pub execution_id: String,
}

impl Command for GetExecutionCmd {
    type Output = Option<Execution>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<Execution>> {
        ctx.tx().find(EXECUTIONS, &self.execution_id)
    }

    fn description(&self) -> String {
        format!("Get execution {}", self.execution_id)
    }
}

/// All executions of a process instance, the instance itself included
pub struct ListExecutionsCmd {
    pub process_instance_id: String,
}

impl Command for ListExecutionsCmd {
    type Output = Vec<Execution>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<Execution>> {
        ctx.tx().query(EXECUTIONS, |e| e.process_instance_id == self.process_instance_id)
    }

    fn description(&self) -> String {
        format!("List executions of {}", self.process_instance_id)
    }
}

pub struct ListDefinitionsCmd;

impl Command for ListDefinitionsCmd {
    type Output = Vec<ProcessDefinition>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<ProcessDefinition>> {
        let mut definitions = ctx.tx().query(PROCESS_DEFINITIONS, |_| true)?;
        definitions.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(definitions)
    }

    fn description(&self) -> String {
        "List process definitions".to_string()
    }
}
