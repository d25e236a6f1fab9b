use crate::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide settings. Every field has a default so a partial (or absent)
/// `config.toml` is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub async_executor: AsyncExecutorConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Optimistic-locking retry policy of the command interceptor chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub wait_ms: u64,
    pub wait_increase_factor: u32,
    pub max_wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            wait_ms: 50,
            wait_increase_factor: 5,
            max_wait_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Upper bound of the backoff before retry number `attempt` (0-based).
    pub fn max_backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.wait_increase_factor.max(1)).saturating_pow(attempt);
        Duration::from_millis(self.wait_ms.saturating_mul(factor).min(self.max_wait_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub poll_interval_ms: u64,
    pub default_wait_ms: u64,
    /// A lock held longer than this may be taken over by another owner.
    pub force_acquire_after_ms: Option<u64>,
    /// Wrap deployments in the deployment lock.
    pub deployment_lock_enabled: bool,
    pub deployment_lock_name: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            default_wait_ms: 5_000,
            force_acquire_after_ms: None,
            deployment_lock_enabled: true,
            deployment_lock_name: "appDeploymentsLock".to_string(),
        }
    }
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }

    pub fn force_acquire_after(&self) -> Option<Duration> {
        self.force_acquire_after_ms.map(Duration::from_millis)
    }
}

/// Which scope an exclusive job is serialized against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusivityScope {
    #[default]
    ProcessInstance,
    Execution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncExecutorConfig {
    /// Dispatch job ids through the message transport instead of polling.
    pub message_queue_mode: bool,
    pub max_jobs_per_acquisition: usize,
    pub max_timer_jobs_per_acquisition: usize,
    pub acquire_wait_ms: u64,
    pub timer_acquire_wait_ms: u64,
    pub max_concurrent_jobs: usize,
    pub lock_time_ms: u64,
    pub default_retries: i32,
    /// Delay before a failed job becomes due again.
    pub retry_wait_ms: u64,
    pub exclusivity_scope: ExclusivityScope,
    pub shutdown_timeout_ms: u64,
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            message_queue_mode: false,
            max_jobs_per_acquisition: 10,
            max_timer_jobs_per_acquisition: 10,
            acquire_wait_ms: 1_000,
            timer_acquire_wait_ms: 1_000,
            max_concurrent_jobs: 8,
            lock_time_ms: 5 * 60 * 1_000,
            default_retries: 3,
            retry_wait_ms: 10_000,
            exclusivity_scope: ExclusivityScope::default(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl AsyncExecutorConfig {
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    pub fn timer_acquire_wait(&self) -> Duration {
        Duration::from_millis(self.timer_acquire_wait_ms)
    }

    pub fn lock_time(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_time_ms as i64)
    }

    pub fn retry_wait(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.retry_wait_ms as i64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Write history through history jobs instead of inside the command.
    pub async_enabled: bool,
    /// Entries applied per history job execution; the remainder stays queued.
    pub batch_size: usize,
    pub default_retries: i32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            async_enabled: true,
            batch_size: 100,
            default_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            dirs::home_dir().map(|home| home.join(".config/agenda/config.toml"))
        }
        #[cfg(target_os = "linux")]
        {
            dirs::config_dir().map(|config| config.join("agenda/config.toml"))
        }
        #[cfg(target_os = "windows")]
        {
            dirs::config_dir().map(|config| config.join("agenda\\config.toml"))
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }

    /// Load the user config file, falling back to defaults when it is absent
    /// or unreadable.
    pub fn load() -> Self {
        if let Some(config_path) = Self::config_path() {
            if config_path.exists() {
                if let Ok(config) = Self::load_from(&config_path) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Load an explicit config file; unlike `load`, errors are reported.
    pub fn load_from(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            EngineError::Validation(format!("Invalid config {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[retry]\nmax_retries = 7\n\n[async_executor]\nexclusivity_scope = \"execution\"\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.wait_ms, 50);
        assert_eq!(
            config.async_executor.exclusivity_scope,
            ExclusivityScope::Execution
        );
        assert_eq!(config.lock.deployment_lock_name, "appDeploymentsLock");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[retry]\nmax_retries = \"many\"\n").unwrap();

        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_backoff(0), Duration::from_millis(50));
        assert_eq!(retry.max_backoff(1), Duration::from_millis(250));
        assert_eq!(retry.max_backoff(2), Duration::from_millis(1_250));
        assert_eq!(retry.max_backoff(3), Duration::from_millis(2_000));
    }
}
