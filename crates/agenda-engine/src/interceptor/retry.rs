use super::{CommandInterceptor, Invocation, Next};
use crate::command::CommandConfig;
use agenda_core::{EngineResult, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// Re-runs the rest of the chain when a commit loses an optimistic-locking
/// race. Must sit above [`super::CommandContextInterceptor`].
#[derive(Debug, Clone)]
pub struct RetryInterceptor {
    config: RetryConfig,
}

impl RetryInterceptor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Random wait in the upper half of the backoff window for this attempt
    fn backoff(&self, attempt: u32) -> Duration {
        let max = self.config.max_backoff(attempt).as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(max / 2..=max);
        Duration::from_millis(millis)
    }
}

impl CommandInterceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn execute(
        &self,
        config: &CommandConfig,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<()> {
        if !config.retry_enabled {
            return next.proceed(config, invocation);
        }

        let mut attempt = 0;
        loop {
            match next.proceed(config, invocation) {
                Err(e) if e.is_optimistic_locking() && attempt < self.config.max_retries => {
                    let wait = self.backoff(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "{}: {}; retry {}/{} in {:?}",
                        invocation.description(),
                        e,
                        attempt,
                        self.config.max_retries,
                        wait
                    );
                    std::thread::sleep(wait);
                }
                Err(e) if e.is_optimistic_locking() => {
                    tracing::warn!(
                        "{}: giving up after {} retries",
                        invocation.description(),
                        attempt
                    );
                    return Err(e);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_inside_window() {
        let interceptor = RetryInterceptor::new(RetryConfig::default());
        for attempt in 0..5 {
            let max = RetryConfig::default().max_backoff(attempt);
            let wait = interceptor.backoff(attempt);
            assert!(wait <= max);
            assert!(wait >= max / 2);
        }
    }

    #[test]
    fn test_zero_backoff() {
        let interceptor = RetryInterceptor::new(RetryConfig {
            wait_ms: 0,
            ..RetryConfig::default()
        });
        assert_eq!(interceptor.backoff(2), Duration::ZERO);
    }
}
