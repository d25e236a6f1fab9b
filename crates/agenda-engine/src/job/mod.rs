//! Persisted deferred work.
//!
//! A job lives in exactly one of four tables; changing its state means
//! deleting it from one table and inserting it into another inside one
//! transaction. The id is kept across moves.

pub mod commands;
pub mod exception;
pub mod handler;
pub mod history;
pub mod manager;

pub use commands::{
    AcquireJobsCmd, AcquireTimerJobsCmd, CreateJobCmd, DeleteJobCmd, ExecuteJobCmd,
    FindJobCmd, HandleFailedJobCmd, JobExecution, ListJobsCmd, LockJobCmd, LockOutcome,
    MoveDeadLetterJobToExecutableCmd, MoveSuspendedJobToExecutableCmd, FailureResolution,
    UnacquireJobCmd,
};
pub use handler::{HistoryJobHandler, HistoryJobOutcome, JobHandler, JobHandlerRegistry};
pub use history::{HistoricActivity, HistoryEntry, HistoryEventType, HistoryJob};

use crate::process::Execution;
use agenda_core::{ExclusivityScope, LogEntry, Loggable};
use agenda_persistence::{Entity, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const JOBS: Table<Job> = Table::new("jobs");
pub const TIMER_JOBS: Table<Job> = Table::new("timer_jobs");
pub const SUSPENDED_JOBS: Table<Job> = Table::new("suspended_jobs");
pub const DEADLETTER_JOBS: Table<Job> = Table::new("deadletter_jobs");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub handler_type: String,
    #[serde(default)]
    pub handler_configuration: Option<String>,
    /// Stable across every move between tables
    pub correlation_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub process_definition_id: Option<String>,
    pub exclusive: bool,
    pub retries: i32,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub lock_expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exception_log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Job {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Loggable for Job {
    fn add_log(&mut self, entry: LogEntry) {
        self.exception_log.push(entry);
    }

    fn get_logs(&self) -> &[LogEntry] {
        &self.exception_log
    }
}

impl Job {
    /// Held by some owner whose lock has not expired yet
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.map_or(true, |until| until > now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.map_or(true, |due| due <= now)
    }

    pub fn lock(&mut self, owner: &str, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }

    /// Key two exclusive jobs must not share while running concurrently
    pub fn exclusivity_key(&self, scope: ExclusivityScope) -> Option<&str> {
        if !self.exclusive {
            return None;
        }
        match scope {
            ExclusivityScope::ProcessInstance => self.process_instance_id.as_deref(),
            ExclusivityScope::Execution => self.execution_id.as_deref(),
        }
    }
}

/// The four states a runtime job can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobTable {
    Executable,
    Timer,
    Suspended,
    DeadLetter,
}

impl JobTable {
    pub const ALL: [JobTable; 4] = [
        JobTable::Executable,
        JobTable::Timer,
        JobTable::Suspended,
        JobTable::DeadLetter,
    ];

    pub fn table(self) -> Table<Job> {
        match self {
            JobTable::Executable => JOBS,
            JobTable::Timer => TIMER_JOBS,
            JobTable::Suspended => SUSPENDED_JOBS,
            JobTable::DeadLetter => DEADLETTER_JOBS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobTable::Executable => "executable",
            JobTable::Timer => "timer",
            JobTable::Suspended => "suspended",
            JobTable::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobTable::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown job table '{}', expected one of executable, timer, suspended, dead-letter",
                    s
                )
            })
    }
}

/// Runtime jobs and history jobs are acquired, dispatched and failed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Runtime,
    History,
}

/// Parameters for creating a job from outside the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub handler_type: String,
    #[serde(default)]
    pub handler_configuration: Option<String>,
    /// In the future: the job starts as a timer
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub retries: Option<i32>,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub process_definition_id: Option<String>,
}

impl JobRequest {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            ..Self::default()
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    pub fn due_at(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Attach the job to an execution; exclusive jobs of one scope never run together
    pub fn for_execution(mut self, execution: &Execution, exclusive: bool) -> Self {
        self.execution_id = Some(execution.id.clone());
        self.process_instance_id = Some(execution.process_instance_id.clone());
        self.process_definition_id = Some(execution.process_definition_id.clone());
        self.exclusive = exclusive;
        self
    }

    /// Attach the job to a process instance by id
    pub fn exclusive_to(mut self, process_instance_id: impl Into<String>) -> Self {
        self.process_instance_id = Some(process_instance_id.into());
        self.exclusive = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> Job {
        Job {
            id: "j".into(),
            handler_type: "noop".into(),
            handler_configuration: None,
            correlation_id: "j".into(),
            execution_id: Some("e".into()),
            process_instance_id: Some("p".into()),
            process_definition_id: None,
            exclusive: true,
            retries: 3,
            due_date: None,
            lock_owner: None,
            lock_expiration: None,
            exception_message: None,
            exception_log: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let mut job = job();
        assert!(!job.is_locked(now));

        job.lock("node-1", now + Duration::minutes(5));
        assert!(job.is_locked(now));
        assert!(!job.is_locked(now + Duration::minutes(6)));

        job.unlock();
        assert!(!job.is_locked(now));
    }

    #[test]
    fn test_exclusivity_key_follows_scope() {
        let mut job = job();
        assert_eq!(job.exclusivity_key(ExclusivityScope::ProcessInstance), Some("p"));
        assert_eq!(job.exclusivity_key(ExclusivityScope::Execution), Some("e"));
        job.exclusive = false;
        assert_eq!(job.exclusivity_key(ExclusivityScope::ProcessInstance), None);
    }

    #[test]
    fn test_job_table_names() {
        for table in JobTable::ALL {
            assert_eq!(table.as_str().parse::<JobTable>().unwrap(), table);
        }
        assert!("archive".parse::<JobTable>().is_err());
        assert_eq!(JobTable::DeadLetter.table().name(), "deadletter_jobs");
    }
}
