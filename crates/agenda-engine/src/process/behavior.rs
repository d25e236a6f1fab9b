use super::Execution;
use crate::context::CommandContext;
use agenda_core::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Work done when an execution passes a task activity. Runs inside the
/// command's transaction; an error rolls the whole command back.
pub trait ActivityBehavior: Send + Sync {
    fn execute(&self, ctx: &mut CommandContext, execution: &Execution) -> EngineResult<()>;
}

impl<F> ActivityBehavior for F
where
    F: Fn(&mut CommandContext, &Execution) -> EngineResult<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut CommandContext, execution: &Execution) -> EngineResult<()> {
        self(ctx, execution)
    }
}

/// Writes a log line and moves on
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBehavior;

impl ActivityBehavior for LogBehavior {
    fn execute(&self, _ctx: &mut CommandContext, execution: &Execution) -> EngineResult<()> {
        tracing::info!(
            "Execution {} of {} passed {}",
            execution.id,
            execution.process_instance_id,
            execution.activity_id.as_deref().unwrap_or("?")
        );
        Ok(())
    }
}

/// Always fails; useful to exercise retries and dead-lettering
#[derive(Debug, Default, Clone, Copy)]
pub struct FailBehavior;

impl ActivityBehavior for FailBehavior {
    fn execute(&self, _ctx: &mut CommandContext, execution: &Execution) -> EngineResult<()> {
        Err(EngineError::Validation(format!(
            "activity {} of execution {} is configured to fail",
            execution.activity_id.as_deref().unwrap_or("?"),
            execution.id
        )))
    }
}

/// Named task behaviors available to process definitions.
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `log` and `fail`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("log", Arc::new(LogBehavior));
        registry.register("fail", Arc::new(FailBehavior));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, behavior: Arc<dyn ActivityBehavior>) {
        self.behaviors.insert(name.into(), behavior);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityBehavior>> {
        self.behaviors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.behaviors.keys().cloned().collect();
        names.sort();
        names
    }
}
