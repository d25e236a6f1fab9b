//! Command-agenda execution engine.
//!
//! A caller executes a [`Command`] through the [`CommandExecutor`]; the
//! interceptor chain opens a [`CommandContext`] (one transaction), the command
//! seeds the [`Agenda`] and the agenda drains operation by operation. Work
//! that must happen later is persisted as a [`Job`] and picked up by the
//! [`AsyncExecutor`] in a new command.

pub mod agenda;
pub mod command;
pub mod context;
pub mod debugger;
pub mod engine;
pub mod events;
pub mod executor;
pub mod interceptor;
pub mod job;
pub mod lock;
pub mod operation;
pub mod process;

pub use agenda::{Agenda, AgendaReport, StepOutcome};
pub use command::{Command, CommandConfig, CommandExecutor};
pub use context::{CommandContext, EngineServices, TransactionListener, TransactionState};
pub use debugger::{ActivityBreakpoints, ContinueFromBreakpointCmd, ProcessDebugger};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use events::{EngineEvent, EngineEventListener};
pub use executor::{
    AsyncExecutor, AsyncExecutorHandle, AsyncHistoryJobMessageReceiver, Destination,
    ExecuteAsyncRunnable, InMemoryTransport, JobMessageReceiver, JobRunOutcome,
    MessageTransport, RunReport,
};
pub use interceptor::{
    CommandContextInterceptor, CommandInterceptor, Invocation, LogInterceptor, Next,
    RetryInterceptor,
};
pub use job::{HistoryJob, Job, JobHandler, JobKind, JobRequest, JobTable};
pub use lock::{LockEntity, LockGuard, LockManager};
pub use operation::{ContinueMode, Operation};
pub use process::{
    Activity, ActivityBehavior, ActivityKind, Execution, ProcessBuilder, ProcessDefinition,
};
