use serde::{Deserialize, Serialize};

/// Notifications dispatched after the transaction that produced them committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessDeployed {
        definition_id: String,
    },
    ProcessStarted {
        process_instance_id: String,
        definition_id: String,
    },
    ProcessCompleted {
        process_instance_id: String,
    },
    JobCreated {
        job_id: String,
        handler_type: String,
    },
    JobExecuted {
        job_id: String,
        handler_type: String,
    },
    BreakpointHit {
        job_id: String,
        execution_id: String,
        activity_id: String,
    },
    /// Every execution touched by the transaction, once each
    ExecutionsChanged {
        execution_ids: Vec<String>,
    },
}

pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}
