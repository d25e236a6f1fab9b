use crate::cli::ProcessAction;
use crate::context::{self, CliContext};
use crate::output;
use std::path::Path;

pub fn handle_deploy(ctx: &CliContext, definition: &Path) -> anyhow::Result<()> {
    let definition = context::read_definition(definition)?;
    let deployed = ctx.engine.deploy(definition)?;
    output::output_success(&deployed);
    Ok(())
}

pub fn handle(ctx: &CliContext, action: ProcessAction) -> anyhow::Result<()> {
    match action {
        ProcessAction::Start { key, variables } => {
            let variables = context::parse_variables(&variables)?;
            let started = ctx.engine.start_process(&key, variables)?;
            // Report the state after the agenda ran, not as inserted
            let instance = ctx.engine.process_instance(&started.id)?.unwrap_or(started);
            output::output_success(&instance);
        }
        ProcessAction::Trigger { execution_id } => {
            ctx.engine.trigger(&execution_id)?;
            output::output_success(serde_json::json!({ "triggered": execution_id }));
        }
        ProcessAction::Get { id } => match ctx.engine.process_instance(&id)? {
            Some(instance) => {
                let executions = ctx.engine.executions(&instance.process_instance_id)?;
                output::output_success(serde_json::json!({
                    "instance": instance,
                    "executions": executions,
                }));
            }
            None => output::output_error(&format!("Execution not found: {}", id)),
        },
        ProcessAction::Definitions => {
            output::output_list(ctx.engine.definitions()?);
        }
    }
    Ok(())
}
