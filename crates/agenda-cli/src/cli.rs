use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agenda")]
#[command(about = "Run and inspect a command-agenda process engine", long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")"))]
pub struct Cli {
    /// Path to the engine data file (or set AGENDA_FILE env var)
    #[arg(long, short, value_name = "FILE", env = "AGENDA_FILE", global = true)]
    pub file: Option<PathBuf>,

    /// Engine config file; defaults to the user config directory
    #[arg(long, value_name = "PATH", env = "AGENDA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Suspend executions before entering this activity (repeatable)
    #[arg(long = "break-at", value_name = "ACTIVITY", global = true)]
    pub breakpoints: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy a process definition from a JSON or TOML file
    Deploy {
        #[arg(long, value_name = "PATH")]
        definition: PathBuf,
    },
    /// Process instance operations
    Process(ProcessCommand),
    /// Job operations
    Job(JobCommand),
    /// Async executor operations
    Executor(ExecutorCommand),
    /// Named lock operations
    Lock(LockCommand),
    /// Debugger operations
    Breakpoint(BreakpointCommand),
    /// Execution history
    History(HistoryCommand),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// Process commands
#[derive(Args)]
pub struct ProcessCommand {
    #[command(subcommand)]
    pub action: ProcessAction,
}

#[derive(Subcommand)]
pub enum ProcessAction {
    /// Start the latest version of a process definition
    Start {
        #[arg(long)]
        key: String,
        /// Process variable as name=value; the value is parsed as JSON if possible
        #[arg(long = "var", value_name = "NAME=VALUE")]
        variables: Vec<String>,
    },
    /// Move a waiting execution on
    Trigger {
        #[arg(long)]
        execution_id: String,
    },
    /// Get a process instance and its executions
    Get {
        #[arg(long)]
        id: String,
    },
    /// List deployed process definitions
    Definitions,
}

// Job commands
#[derive(Args)]
pub struct JobCommand {
    #[command(subcommand)]
    pub action: JobAction,
}

#[derive(Subcommand)]
pub enum JobAction {
    /// Create a job
    Create(JobCreateArgs),
    /// List jobs of one table
    List {
        /// executable, timer, suspended or dead-letter
        #[arg(long, default_value = "executable")]
        table: String,
    },
    /// Move a dead-letter job back to executable
    Retry {
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 3)]
        retries: i32,
    },
    /// Delete a job from whichever table holds it
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[derive(Args)]
pub struct JobCreateArgs {
    #[arg(long)]
    pub handler_type: String,
    #[arg(long)]
    pub configuration: Option<String>,
    /// Delay before the job becomes due; it starts as a timer
    #[arg(long)]
    pub due_in_secs: Option<i64>,
    #[arg(long)]
    pub retries: Option<i32>,
    /// Never run together with other exclusive jobs of this process instance
    #[arg(long)]
    pub exclusive_to: Option<String>,
}

// Executor commands
#[derive(Args)]
pub struct ExecutorCommand {
    #[command(subcommand)]
    pub action: ExecutorAction,
}

#[derive(Subcommand)]
pub enum ExecutorAction {
    /// Execute every job that is due now, then exit
    RunOnce {
        /// Lock owner recorded on acquired jobs
        #[arg(long, default_value = "agenda-cli")]
        owner: String,
    },
}

// Lock commands
#[derive(Args)]
pub struct LockCommand {
    #[command(subcommand)]
    pub action: LockAction,
}

#[derive(Subcommand)]
pub enum LockAction {
    /// Try once to take a lock
    Acquire {
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
        /// Take over a lock held longer than this
        #[arg(long)]
        force_after_ms: Option<u64>,
    },
    /// Release a lock held by the owner
    Release {
        #[arg(long)]
        name: String,
        #[arg(long, required_unless_present = "force")]
        owner: Option<String>,
        /// Release regardless of the holder
        #[arg(long)]
        force: bool,
    },
    /// Show the current holder of a lock
    Status {
        #[arg(long)]
        name: String,
    },
    /// Wait for a lock until it is free or the timeout passes
    Wait {
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

// Breakpoint commands
#[derive(Args)]
pub struct BreakpointCommand {
    #[command(subcommand)]
    pub action: BreakpointAction,
}

#[derive(Subcommand)]
pub enum BreakpointAction {
    /// Resume the execution suspended by a breakpoint job
    Continue {
        #[arg(long)]
        job_id: String,
    },
}

// History commands
#[derive(Args)]
pub struct HistoryCommand {
    #[command(subcommand)]
    pub action: HistoryAction,
}

#[derive(Subcommand)]
pub enum HistoryAction {
    /// List written history, oldest first
    List {
        #[arg(long)]
        process_instance_id: Option<String>,
    },
    /// List history jobs not applied yet
    Jobs,
}
