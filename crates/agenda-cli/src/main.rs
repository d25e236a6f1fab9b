mod cli;
mod context;
mod handlers;
mod output;

use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use context::CliContext;
use tracing_subscriber::EnvFilter;

fn init_tracing() -> anyhow::Result<()> {
    if let Ok(log_path) = std::env::var("AGENDA_DEBUG_LOG") {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "agenda", &mut std::io::stdout());
        return Ok(());
    }

    let Some(file_path) = cli.file else {
        output::output_error("--file is required (or set AGENDA_FILE)");
    };
    let ctx = match CliContext::load(&file_path, cli.config.as_deref(), &cli.breakpoints) {
        Ok(ctx) => ctx,
        Err(e) => output::output_error(&e.to_string()),
    };
    tracing::debug!("Using data file {}", ctx.file().display());

    let result = match cli.command {
        Commands::Deploy { definition } => handlers::process::handle_deploy(&ctx, &definition),
        Commands::Process(cmd) => handlers::process::handle(&ctx, cmd.action),
        Commands::Job(cmd) => handlers::job::handle(&ctx, cmd.action),
        Commands::Executor(cmd) => handlers::executor::handle(&ctx, cmd.action).await,
        Commands::Lock(cmd) => handlers::lock::handle(&ctx, cmd.action),
        Commands::Breakpoint(cmd) => handlers::breakpoint::handle(&ctx, cmd.action),
        Commands::History(cmd) => handlers::history::handle(&ctx, cmd.action),
        Commands::Completions { .. } => Ok(()),
    };

    if let Err(e) = result {
        output::output_error(&e.to_string());
    }
    Ok(())
}
