pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod result;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AsyncExecutorConfig, EngineConfig, ExclusivityScope, HistoryConfig, LockConfig, RetryConfig,
};
pub use error::EngineError;
pub use logging::{LogEntry, Loggable};
pub use result::EngineResult;

/// Generate a fresh random identifier for persisted rows.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
