use super::{CommandInterceptor, Invocation, Next};
use crate::command::CommandConfig;
use agenda_core::EngineResult;

/// Wraps each command in a tracing span.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInterceptor;

impl CommandInterceptor for LogInterceptor {
    fn name(&self) -> &'static str {
        "log"
    }

    fn execute(
        &self,
        config: &CommandConfig,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<()> {
        let span = tracing::debug_span!("command", name = %invocation.description());
        let _entered = span.enter();
        tracing::debug!("--- starting {} ---", invocation.description());
        let result = next.proceed(config, invocation);
        match &result {
            Ok(()) => tracing::debug!("--- {} finished ---", invocation.description()),
            Err(e) => tracing::debug!("--- {} failed: {} ---", invocation.description(), e),
        }
        result
    }
}
