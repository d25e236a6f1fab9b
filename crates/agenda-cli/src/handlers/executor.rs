use crate::cli::ExecutorAction;
use crate::context::CliContext;
use crate::output;
use agenda_engine::AsyncExecutor;
use std::sync::Arc;

pub async fn handle(ctx: &CliContext, action: ExecutorAction) -> anyhow::Result<()> {
    match action {
        ExecutorAction::RunOnce { owner } => {
            let executor = AsyncExecutor::new(Arc::clone(ctx.engine.command_executor()), owner);
            let report = executor.run_once().await?;
            output::output_success(serde_json::json!({
                "timers_moved": report.timers_moved,
                "executed": report.executed,
                "history_executed": report.history_executed,
                "partial": report.partial,
                "skipped": report.skipped,
                "failed": report.failed,
            }));
        }
    }
    Ok(())
}
