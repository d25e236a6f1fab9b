use crate::cli::{JobAction, JobCreateArgs};
use crate::context::CliContext;
use crate::output;
use agenda_engine::job::DeleteJobCmd;
use agenda_engine::{JobRequest, JobTable};
use chrono::{Duration, Utc};

pub fn handle(ctx: &CliContext, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Create(args) => {
            let job = ctx.engine.create_job(request_from(args))?;
            output::output_success(&job);
        }
        JobAction::List { table } => {
            let table: JobTable = table.parse().map_err(anyhow::Error::msg)?;
            output::output_list(ctx.engine.jobs(table)?);
        }
        JobAction::Retry { id, retries } => {
            let job = ctx.engine.retry_dead_letter_job(&id, retries)?;
            output::output_success(&job);
        }
        JobAction::Delete { id } => {
            let table = ctx
                .engine
                .command_executor()
                .execute(&DeleteJobCmd { job_id: id.clone() })?;
            output::output_success(serde_json::json!({ "deleted": id, "table": table }));
        }
    }
    Ok(())
}

fn request_from(args: JobCreateArgs) -> JobRequest {
    let mut request = JobRequest::new(args.handler_type);
    if let Some(configuration) = args.configuration {
        request = request.with_configuration(configuration);
    }
    if let Some(secs) = args.due_in_secs {
        request = request.due_at(Utc::now() + Duration::seconds(secs));
    }
    if let Some(retries) = args.retries {
        request = request.with_retries(retries);
    }
    if let Some(instance) = args.exclusive_to {
        request = request.exclusive_to(instance);
    }
    request
}
