use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A row was changed by another transaction between read and commit.
    #[error("Optimistic locking failure: {table} {id} was updated by another transaction concurrently")]
    OptimisticLocking { table: String, id: String },

    #[error("Lock {name} could not be acquired, currently held by {}", .holder.as_deref().unwrap_or("nobody"))]
    LockUnavailable {
        name: String,
        holder: Option<String>,
    },

    #[error("Job data integrity error: {0}")]
    JobDataIntegrity(String),

    #[error("Job {job_id} failed: {message}")]
    JobExecution { job_id: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn optimistic_locking(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::OptimisticLocking {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Whether the failure is transient and the whole command may be retried.
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, Self::OptimisticLocking { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unavailable_names_holder() {
        let err = EngineError::LockUnavailable {
            name: "appDeploymentsLock".into(),
            holder: Some("node-1".into()),
        };
        assert_eq!(
            err.to_string(),
            "Lock appDeploymentsLock could not be acquired, currently held by node-1"
        );

        let err = EngineError::LockUnavailable {
            name: "appDeploymentsLock".into(),
            holder: None,
        };
        assert!(err.to_string().ends_with("held by nobody"));
    }

    #[test]
    fn test_optimistic_locking_classification() {
        assert!(EngineError::optimistic_locking("jobs", "1").is_optimistic_locking());
        assert!(!EngineError::NotFound("job 1".into()).is_optimistic_locking());
    }
}
