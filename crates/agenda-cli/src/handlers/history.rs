use crate::cli::HistoryAction;
use crate::context::CliContext;
use crate::output;

pub fn handle(ctx: &CliContext, action: HistoryAction) -> anyhow::Result<()> {
    match action {
        HistoryAction::List {
            process_instance_id,
        } => {
            let records = ctx
                .engine
                .historic_activities(process_instance_id.as_deref())?;
            output::output_list(records);
        }
        HistoryAction::Jobs => {
            output::output_list(ctx.engine.history_jobs()?);
        }
    }
    Ok(())
}
