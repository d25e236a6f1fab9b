use crate::context::{CommandContext, EngineServices};
use crate::interceptor::{
    CommandContextInterceptor, CommandInterceptor, Invocation, LogInterceptor, Next,
    RetryInterceptor,
};
use agenda_core::{EngineError, EngineResult};
use std::sync::Arc;

/// A unit of work against the engine.
/// Commands run inside a [`CommandContext`] and must not keep state between
/// calls: a retried command is executed again from scratch.
pub trait Command: Send + Sync {
    type Output;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;

    /// Human-readable description of what this command does
    fn description(&self) -> String;
}

/// Per-call switches read by interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub retry_enabled: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            retry_enabled: true,
        }
    }
}

impl CommandConfig {
    /// Optimistic-locking failures surface to the caller on the first attempt
    pub fn without_retry() -> Self {
        Self {
            retry_enabled: false,
        }
    }
}

/// Entry point for running commands through the interceptor chain.
pub struct CommandExecutor {
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    default_config: CommandConfig,
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    pub fn new(
        services: Arc<EngineServices>,
        interceptors: Vec<Arc<dyn CommandInterceptor>>,
    ) -> Self {
        Self {
            interceptors,
            default_config: CommandConfig::default(),
            services,
        }
    }

    /// `[Log, custom..., Retry, CommandContext]`. Retry sits above the
    /// context interceptor so every attempt gets a fresh transaction.
    pub fn with_default_chain(
        services: Arc<EngineServices>,
        custom: Vec<Arc<dyn CommandInterceptor>>,
    ) -> Self {
        let mut interceptors: Vec<Arc<dyn CommandInterceptor>> = vec![Arc::new(LogInterceptor)];
        interceptors.extend(custom);
        interceptors.push(Arc::new(RetryInterceptor::new(
            services.config.retry.clone(),
        )));
        interceptors.push(Arc::new(CommandContextInterceptor));
        Self::new(services, interceptors)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn execute<C: Command>(&self, command: &C) -> EngineResult<C::Output> {
        self.execute_with_config(&self.default_config, command)
    }

    pub fn execute_with_config<C: Command>(
        &self,
        config: &CommandConfig,
        command: &C,
    ) -> EngineResult<C::Output> {
        let mut output = None;
        let mut body = |ctx: &mut CommandContext| -> EngineResult<()> {
            output = Some(command.execute(ctx)?);
            Ok(())
        };
        let mut invocation = Invocation::new(
            command.description(),
            &mut body,
            Arc::clone(&self.services),
        );
        Next::new(&self.interceptors).proceed(config, &mut invocation)?;
        drop(invocation);
        output.ok_or_else(|| {
            EngineError::Internal(format!(
                "command '{}' completed without output",
                command.description()
            ))
        })
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("interceptors", &self.interceptor_names())
            .field("default_config", &self.default_config)
            .finish()
    }
}
