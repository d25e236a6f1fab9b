use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-stamped message attached to a persisted row, e.g. one failed
/// attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: String) -> Self {
        Self::at(Utc::now(), message)
    }

    pub fn at(timestamp: DateTime<Utc>, message: String) -> Self {
        Self { timestamp, message }
    }
}

pub trait Loggable {
    fn add_log(&mut self, entry: LogEntry);
    fn get_logs(&self) -> &[LogEntry];
}
