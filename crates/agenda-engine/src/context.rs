//! Per-transaction execution context.

use crate::agenda::Agenda;
use crate::debugger::ProcessDebugger;
use crate::events::{EngineEvent, EngineEventListener};
use crate::executor::MessageTransport;
use crate::job::handler::{HistoryJobHandler, JobHandlerRegistry};
use crate::job::history::{self, HistoryEntry};
use crate::operation::Operation;
use crate::process::BehaviorRegistry;
use agenda_core::{Clock, EngineConfig, EngineError, EngineResult};
use agenda_persistence::{Store, Transaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Moment of the transaction lifecycle a [`TransactionListener`] is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Inside the still-open transaction, right before commit
    Committing,
    /// After a successful commit, in a new transaction
    Committed,
    /// Inside the failing transaction, right before rollback
    RollingBack,
    /// After rollback, in a new transaction
    RolledBack,
}

pub trait TransactionListener: Send + Sync {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()>;

    fn description(&self) -> String {
        "transaction listener".to_string()
    }
}

/// Everything a command may need beyond its own input. Shared by every
/// context the engine creates.
pub struct EngineServices {
    pub store: Arc<Store>,
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub behaviors: BehaviorRegistry,
    pub job_handlers: JobHandlerRegistry,
    pub history_handler: Arc<dyn HistoryJobHandler>,
    pub debugger: Option<Arc<dyn ProcessDebugger>>,
    pub transport: Option<Arc<dyn MessageTransport>>,
    pub event_listeners: Vec<Arc<dyn EngineEventListener>>,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("store", &self.store)
            .field("behaviors", &self.behaviors.names())
            .field("job_handlers", &self.job_handlers.types())
            .field("debugger", &self.debugger.is_some())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

/// One command's unit of work: the transaction, the agenda and everything
/// registered while operations run. Created by the context interceptor and
/// closed exactly once, with commit or rollback.
pub struct CommandContext {
    tx: Transaction,
    agenda: Agenda,
    services: Arc<EngineServices>,
    listeners: Vec<(TransactionState, Arc<dyn TransactionListener>)>,
    events: Vec<EngineEvent>,
    history: Vec<HistoryEntry>,
}

impl CommandContext {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self {
            tx: services.store.begin(),
            agenda: Agenda::new(),
            services,
            listeners: Vec::new(),
            events: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn tx(&mut self) -> &mut Transaction {
        &mut self.tx
    }

    pub fn agenda(&mut self) -> &mut Agenda {
        &mut self.agenda
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Executions touched by operations planned in this context, in first-seen order
    pub fn involved_executions(&self) -> &[String] {
        self.agenda.involved_executions()
    }

    pub fn plan_operation(&mut self, operation: Operation) {
        self.agenda.plan_operation(operation);
    }

    pub fn add_transaction_listener(
        &mut self,
        state: TransactionState,
        listener: Arc<dyn TransactionListener>,
    ) {
        self.listeners.push((state, listener));
    }

    /// Queue an event; listeners only see it once the transaction committed
    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn record_history(&mut self, mut entry: HistoryEntry) {
        if self.services.config.history.enabled {
            entry.sequence = self.history.len() as u64;
            self.history.push(entry);
        }
    }

    fn listeners_for(&self, state: TransactionState) -> Vec<Arc<dyn TransactionListener>> {
        self.listeners
            .iter()
            .filter(|(s, _)| *s == state)
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// End the transaction according to the command's result.
    ///
    /// Success: `Committing` listeners, history flush, commit, events,
    /// `Committed` listeners. Failure (including a failed commit):
    /// `RollingBack` listeners, rollback, `RolledBack` listeners. The
    /// command's own error always wins over errors raised while cleaning up.
    pub fn close(mut self, result: EngineResult<()>) -> EngineResult<()> {
        if let Err(error) = result {
            return self.abort(error);
        }

        if let Err(error) = self.prepare_commit() {
            return self.abort(error);
        }

        let committed = self.listeners_for(TransactionState::Committed);
        let services = Arc::clone(&self.services);
        let mut events = std::mem::take(&mut self.events);
        let involved = self.agenda.involved_executions().to_vec();

        let fresh = services.store.begin();
        let tx = std::mem::replace(&mut self.tx, fresh);
        if let Err(error) = tx.commit() {
            tracing::debug!("Commit failed: {}", error);
            // The rejected writes are gone; rolling-back listeners see an empty transaction
            return self.abort(error);
        }

        if !involved.is_empty() {
            events.push(EngineEvent::ExecutionsChanged {
                execution_ids: involved,
            });
        }
        for event in &events {
            for listener in &services.event_listeners {
                listener.on_event(event);
            }
        }
        run_in_new_context(&services, TransactionState::Committed, &committed);
        Ok(())
    }

    fn prepare_commit(&mut self) -> EngineResult<()> {
        for listener in self.listeners_for(TransactionState::Committing) {
            listener.execute(self)?;
        }
        // Committing listeners may plan operations too
        self.run_agenda()?;
        if !self.history.is_empty() {
            let entries = std::mem::take(&mut self.history);
            history::flush(self, entries)?;
        }
        Ok(())
    }

    fn abort(mut self, error: EngineError) -> EngineResult<()> {
        for listener in self.listeners_for(TransactionState::RollingBack) {
            if let Err(e) = listener.execute(&mut self) {
                tracing::warn!(
                    "Rolling-back listener '{}' failed: {}",
                    listener.description(),
                    e
                );
            }
        }
        let rolled_back = self.listeners_for(TransactionState::RolledBack);
        let services = Arc::clone(&self.services);
        self.tx.rollback();
        run_in_new_context(&services, TransactionState::RolledBack, &rolled_back);
        Err(error)
    }
}

/// Run post-transaction listeners, each in its own fresh context. Their
/// failures cannot undo the outcome of the original command, so they are
/// logged only.
fn run_in_new_context(
    services: &Arc<EngineServices>,
    state: TransactionState,
    listeners: &[Arc<dyn TransactionListener>],
) {
    for listener in listeners {
        let mut ctx = CommandContext::new(Arc::clone(services));
        let result = listener
            .execute(&mut ctx)
            .and_then(|_| ctx.run_agenda().map(|_| ()));
        if let Err(e) = ctx.close(result) {
            tracing::warn!(
                "{:?} listener '{}' failed: {}",
                state,
                listener.description(),
                e
            );
        }
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("tx", &self.tx)
            .field("agenda", &self.agenda)
            .field("listeners", &self.listeners.len())
            .field("events", &self.events.len())
            .finish()
    }
}
