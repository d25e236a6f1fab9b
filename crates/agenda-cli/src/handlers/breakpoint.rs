use crate::cli::BreakpointAction;
use crate::context::CliContext;
use crate::output;

pub fn handle(ctx: &CliContext, action: BreakpointAction) -> anyhow::Result<()> {
    match action {
        BreakpointAction::Continue { job_id } => {
            ctx.engine.continue_from_breakpoint(&job_id)?;
            output::output_success(serde_json::json!({ "continued": job_id }));
        }
    }
    Ok(())
}
