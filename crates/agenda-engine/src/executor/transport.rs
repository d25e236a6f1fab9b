use agenda_core::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, Mutex};

/// Queue a job id is announced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    Jobs,
    HistoryJobs,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Jobs => f.write_str("jobs"),
            Destination::HistoryJobs => f.write_str("history-jobs"),
        }
    }
}

/// Carries job ids from the committing node to whichever node runs the job.
///
/// Delivery may be duplicated; receivers lock the job before running it and
/// skip ids that no longer exist.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn send(&self, destination: Destination, job_id: &str) -> EngineResult<()>;

    /// Next id for `destination`; `None` once the transport is closed
    async fn receive(&self, destination: Destination) -> Option<String>;
}

struct Queue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

/// Single-process transport over tokio channels
pub struct InMemoryTransport {
    jobs: Queue,
    history_jobs: Queue,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            jobs: Queue::new(),
            history_jobs: Queue::new(),
        }
    }

    fn queue(&self, destination: Destination) -> &Queue {
        match destination {
            Destination::Jobs => &self.jobs,
            Destination::HistoryJobs => &self.history_jobs,
        }
    }

    /// Take whatever is queued right now without waiting
    pub async fn drain(&self, destination: Destination) -> Vec<String> {
        let mut rx = self.queue(destination).rx.lock().await;
        let mut ids = Vec::new();
        while let Ok(id) = rx.try_recv() {
            ids.push(id);
        }
        ids
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    fn send(&self, destination: Destination, job_id: &str) -> EngineResult<()> {
        tracing::trace!("Sending {} to {}", job_id, destination);
        self.queue(destination)
            .tx
            .send(job_id.to_string())
            .map_err(|_| EngineError::Internal(format!("{} queue is closed", destination)))
    }

    async fn receive(&self, destination: Destination) -> Option<String> {
        self.queue(destination).rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destinations_are_separate_queues() {
        let transport = InMemoryTransport::new();
        transport.send(Destination::Jobs, "a").unwrap();
        transport.send(Destination::HistoryJobs, "h").unwrap();
        transport.send(Destination::Jobs, "b").unwrap();

        assert_eq!(transport.receive(Destination::Jobs).await.as_deref(), Some("a"));
        assert_eq!(transport.drain(Destination::Jobs).await, vec!["b"]);
        assert_eq!(transport.drain(Destination::HistoryJobs).await, vec!["h"]);
        assert!(transport.drain(Destination::Jobs).await.is_empty());
    }
}
