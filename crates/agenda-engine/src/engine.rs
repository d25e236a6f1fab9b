//! Wiring of services, the command executor and the runtime/management API.

use crate::command::CommandExecutor;
use crate::context::EngineServices;
use crate::debugger::{ContinueFromBreakpointCmd, ProcessDebugger};
use crate::events::EngineEventListener;
use crate::executor::{
    AsyncExecutor, AsyncHistoryJobMessageReceiver, JobMessageReceiver, MessageTransport,
};
use crate::interceptor::CommandInterceptor;
use crate::job::handler::{HistoryJobHandler, JobHandler, JobHandlerRegistry};
use crate::job::history::{
    HistoricActivitiesCmd, HistoricActivity, HistoricActivityJobHandler, ListHistoryJobsCmd,
};
use crate::job::{
    CreateJobCmd, HistoryJob, Job, JobRequest, JobTable, ListJobsCmd,
    MoveDeadLetterJobToExecutableCmd,
};
use crate::lock::LockManager;
use crate::process::commands::{
    DeployCmd, GetExecutionCmd, ListDefinitionsCmd, ListExecutionsCmd, StartProcessCmd,
    TriggerExecutionCmd,
};
use crate::process::{ActivityBehavior, BehaviorRegistry, Execution, ProcessDefinition};
use agenda_core::{new_id, Clock, EngineConfig, EngineResult, SystemClock};
use agenda_persistence::Store;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a [`ProcessEngine`]. Everything is optional: the defaults are an
/// in-memory store, the system clock and the built-in handlers.
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<Store>>,
    clock: Arc<dyn Clock>,
    behaviors: BehaviorRegistry,
    job_handlers: JobHandlerRegistry,
    history_handler: Arc<dyn HistoryJobHandler>,
    debugger: Option<Arc<dyn ProcessDebugger>>,
    transport: Option<Arc<dyn MessageTransport>>,
    event_listeners: Vec<Arc<dyn EngineEventListener>>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    node_id: Option<String>,
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            clock: Arc::new(SystemClock),
            behaviors: BehaviorRegistry::with_defaults(),
            job_handlers: JobHandlerRegistry::with_defaults(),
            history_handler: Arc::new(HistoricActivityJobHandler),
            debugger: None,
            transport: None,
            event_listeners: Vec::new(),
            interceptors: Vec::new(),
            node_id: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_behavior(
        mut self,
        name: impl Into<String>,
        behavior: Arc<dyn ActivityBehavior>,
    ) -> Self {
        self.behaviors.register(name, behavior);
        self
    }

    pub fn with_job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.register(handler);
        self
    }

    pub fn with_history_handler(mut self, handler: Arc<dyn HistoryJobHandler>) -> Self {
        self.history_handler = handler;
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn ProcessDebugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.event_listeners.push(listener);
        self
    }

    /// Runs between the log and retry interceptors
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Owner id used for job and lock ownership; random when not set
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn build(self) -> ProcessEngine {
        let services = Arc::new(EngineServices {
            store: self.store.unwrap_or_else(Store::in_memory),
            config: self.config,
            clock: self.clock,
            behaviors: self.behaviors,
            job_handlers: self.job_handlers,
            history_handler: self.history_handler,
            debugger: self.debugger,
            transport: self.transport,
            event_listeners: self.event_listeners,
        });
        let executor = Arc::new(CommandExecutor::with_default_chain(
            Arc::clone(&services),
            self.interceptors,
        ));
        let node_id = self.node_id.unwrap_or_else(|| format!("node-{}", new_id()));
        tracing::debug!("Process engine {} built: {:?}", node_id, executor);
        ProcessEngine {
            services,
            executor,
            node_id,
        }
    }
}

/// Entry point for embedding the engine.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    executor: Arc<CommandExecutor>,
    node_id: String,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    pub fn command_executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn lock_manager(&self, name: impl Into<String>) -> LockManager {
        LockManager::new(Arc::clone(&self.executor), name, self.node_id.clone())
    }

    pub fn async_executor(&self) -> Arc<AsyncExecutor> {
        Arc::new(AsyncExecutor::new(
            Arc::clone(&self.executor),
            self.node_id.clone(),
        ))
    }

    pub fn job_message_receiver(&self) -> JobMessageReceiver {
        self.async_executor().job_message_receiver()
    }

    pub fn history_job_message_receiver(&self) -> AsyncHistoryJobMessageReceiver {
        self.async_executor().history_job_message_receiver()
    }

    /// Deploy a new version of a definition, serialized across nodes by the
    /// deployment lock unless that is disabled
    pub fn deploy(&self, definition: ProcessDefinition) -> EngineResult<ProcessDefinition> {
        let command = DeployCmd { definition };
        let lock = &self.services.config.lock;
        if !lock.deployment_lock_enabled {
            return self.executor.execute(&command);
        }
        self.lock_manager(lock.deployment_lock_name.clone())
            .wait_for_lock_run_and_release(lock.default_wait(), || {
                self.executor.execute(&command)
            })
    }

    pub fn definitions(&self) -> EngineResult<Vec<ProcessDefinition>> {
        self.executor.execute(&ListDefinitionsCmd)
    }

    /// Start the latest version of `key` and run it until it waits or ends
    pub fn start_process(
        &self,
        key: &str,
        variables: BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<Execution> {
        self.executor.execute(&StartProcessCmd {
            key: key.to_string(),
            variables,
        })
    }

    pub fn trigger(&self, execution_id: &str) -> EngineResult<()> {
        self.executor.execute(&TriggerExecutionCmd {
            execution_id: execution_id.to_string(),
        })
    }

    /// Current state of an execution or process instance
    pub fn process_instance(&self, id: &str) -> EngineResult<Option<Execution>> {
        self.executor.execute(&GetExecutionCmd {
            execution_id: id.to_string(),
        })
    }

    pub fn executions(&self, process_instance_id: &str) -> EngineResult<Vec<Execution>> {
        self.executor.execute(&ListExecutionsCmd {
            process_instance_id: process_instance_id.to_string(),
        })
    }

    pub fn create_job(&self, request: JobRequest) -> EngineResult<Job> {
        self.executor.execute(&CreateJobCmd { request })
    }

    pub fn jobs(&self, table: JobTable) -> EngineResult<Vec<Job>> {
        self.executor.execute(&ListJobsCmd { table })
    }

    pub fn retry_dead_letter_job(&self, job_id: &str, retries: i32) -> EngineResult<Job> {
        self.executor.execute(&MoveDeadLetterJobToExecutableCmd {
            job_id: job_id.to_string(),
            retries,
        })
    }

    pub fn continue_from_breakpoint(&self, job_id: &str) -> EngineResult<()> {
        self.executor.execute(&ContinueFromBreakpointCmd {
            job_id: job_id.to_string(),
        })
    }

    pub fn history_jobs(&self) -> EngineResult<Vec<HistoryJob>> {
        self.executor.execute(&ListHistoryJobsCmd)
    }

    pub fn historic_activities(
        &self,
        process_instance_id: Option<&str>,
    ) -> EngineResult<Vec<HistoricActivity>> {
        self.executor.execute(&HistoricActivitiesCmd {
            process_instance_id: process_instance_id.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use crate::process::{Activity, ProcessBuilder};
    use agenda_core::EngineError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<EngineEvent>>);

    impl EngineEventListener for Collect {
        fn on_event(&self, event: &EngineEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn simple() -> ProcessDefinition {
        ProcessBuilder::new("simple")
            .activity(Activity::start("start").to("end"))
            .activity(Activity::end("end"))
            .build()
    }

    #[test]
    fn test_redeploy_creates_new_version() {
        let engine = ProcessEngine::builder().build();
        let v1 = engine.deploy(simple()).unwrap();
        let v2 = engine.deploy(simple()).unwrap();
        assert_eq!((v1.id.as_str(), v1.version), ("simple:1", 1));
        assert_eq!((v2.id.as_str(), v2.version), ("simple:2", 2));
        assert_eq!(engine.definitions().unwrap().len(), 2);

        // The deployment lock was released after each deployment
        let lock = engine.lock_manager("appDeploymentsLock");
        assert_eq!(lock.lock_value().unwrap(), None);
    }

    #[test]
    fn test_deploy_fails_while_another_node_holds_the_lock() {
        let mut config = EngineConfig::default();
        config.lock.default_wait_ms = 20;
        config.lock.poll_interval_ms = 5;
        let engine = ProcessEngine::builder().with_config(config).build();
        let other = LockManager::new(
            Arc::clone(engine.command_executor()),
            "appDeploymentsLock",
            "other-node",
        );
        assert!(other.acquire_lock().unwrap());

        let err = engine.deploy(simple()).unwrap_err();
        assert!(matches!(err, EngineError::LockUnavailable { .. }));
        assert!(engine.definitions().unwrap().is_empty());

        other.release_lock().unwrap();
        engine.deploy(simple()).unwrap();
    }

    #[test]
    fn test_events_reach_listeners_after_commit() {
        let events = Arc::new(Collect::default());
        let engine = ProcessEngine::builder()
            .with_event_listener(events.clone())
            .build();
        engine.deploy(simple()).unwrap();
        let instance = engine.start_process("simple", BTreeMap::new()).unwrap();

        let seen = events.0.lock().clone();
        assert!(matches!(seen[0], EngineEvent::ProcessDeployed { .. }));
        assert!(seen.contains(&EngineEvent::ProcessCompleted {
            process_instance_id: instance.id.clone(),
        }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, EngineEvent::ExecutionsChanged { .. })));
    }

    #[test]
    fn test_file_store_is_shared_between_engines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agenda.json");
        let first = ProcessEngine::builder()
            .with_store(Store::json_file(&path).unwrap())
            .build();
        first.deploy(simple()).unwrap();

        let second = ProcessEngine::builder()
            .with_store(Store::json_file(&path).unwrap())
            .build();
        let instance = second.start_process("simple", BTreeMap::new()).unwrap();
        assert!(first.process_instance(&instance.id).unwrap().unwrap().ended);
    }
}
