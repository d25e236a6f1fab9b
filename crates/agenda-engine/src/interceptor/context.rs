use super::{CommandInterceptor, Invocation, Next};
use crate::command::CommandConfig;
use crate::context::CommandContext;
use agenda_core::{EngineError, EngineResult};
use std::sync::Arc;

/// Transaction boundary: opens a [`CommandContext`] for the rest of the
/// chain and closes it with commit or rollback.
///
/// A context that is already installed is reused, so a nested context
/// interceptor joins the outer transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandContextInterceptor;

impl CommandInterceptor for CommandContextInterceptor {
    fn name(&self) -> &'static str {
        "command-context"
    }

    fn execute(
        &self,
        config: &CommandConfig,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<()> {
        if invocation.has_context() {
            return next.proceed(config, invocation);
        }

        let ctx = CommandContext::new(Arc::clone(invocation.services()));
        invocation.install_context(ctx);
        let result = next.proceed(config, invocation);
        let ctx = invocation.take_context().ok_or_else(|| {
            EngineError::IllegalState(format!(
                "command context of '{}' was removed by an interceptor",
                invocation.description()
            ))
        })?;
        ctx.close(result)
    }
}
