//! The chain every command passes through.
//!
//! Each interceptor gets the [`Invocation`] and a [`Next`] handle on the rest
//! of the chain. The end of the chain runs the command body and drains the
//! agenda, which needs a [`CommandContext`] installed by
//! [`CommandContextInterceptor`].

mod context;
mod log;
mod retry;

pub use context::CommandContextInterceptor;
pub use log::LogInterceptor;
pub use retry::RetryInterceptor;

use crate::command::CommandConfig;
use crate::context::{CommandContext, EngineServices};
use agenda_core::{EngineError, EngineResult};
use std::sync::Arc;

pub trait CommandInterceptor: Send + Sync {
    /// Short stable name for logs and diagnostics
    fn name(&self) -> &'static str;

    fn execute(
        &self,
        config: &CommandConfig,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<()>;
}

type Body<'a> = dyn FnMut(&mut CommandContext) -> EngineResult<()> + 'a;

/// One call travelling down the chain.
pub struct Invocation<'a> {
    description: String,
    body: &'a mut Body<'a>,
    services: Arc<EngineServices>,
    context: Option<CommandContext>,
    attempts: u32,
}

impl<'a> Invocation<'a> {
    pub fn new(description: String, body: &'a mut Body<'a>, services: Arc<EngineServices>) -> Self {
        Self {
            description,
            body,
            services,
            context: None,
            attempts: 0,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// How many times the body has been started
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn install_context(&mut self, ctx: CommandContext) {
        self.context = Some(ctx);
    }

    pub fn take_context(&mut self) -> Option<CommandContext> {
        self.context.take()
    }

    fn invoke(&mut self) -> EngineResult<()> {
        let ctx = self.context.as_mut().ok_or_else(|| {
            EngineError::IllegalState(format!(
                "no command context active for '{}'",
                self.description
            ))
        })?;
        self.attempts += 1;
        (self.body)(ctx)?;
        ctx.run_agenda()?;
        Ok(())
    }
}

/// The part of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'c> {
    remaining: &'c [Arc<dyn CommandInterceptor>],
}

impl<'c> Next<'c> {
    pub fn new(interceptors: &'c [Arc<dyn CommandInterceptor>]) -> Self {
        Self {
            remaining: interceptors,
        }
    }

    pub fn proceed(self, config: &CommandConfig, invocation: &mut Invocation<'_>) -> EngineResult<()> {
        match self.remaining.split_first() {
            Some((head, rest)) => head.execute(config, invocation, Next { remaining: rest }),
            None => invocation.invoke(),
        }
    }
}
