//! Job event bus: broadcast fan-out of job lifecycle events.
//!
//! Events are notifications only. Nothing in the engine waits on them, so a
//! slow or missing subscriber never affects execution.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::jobs::model::JobStatus;
use crate::store::traits::LogLevel;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something that happened to a job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged {
        job_id: Uuid,
        parent_id: Option<Uuid>,
        job_type: String,
        from: JobStatus,
        to: JobStatus,
    },
    /// A parent job's subtree finished.
    Completed {
        job_id: Uuid,
        status: JobStatus,
        possibly_incomplete: bool,
    },
    Notification {
        job_id: Uuid,
        channel: Option<String>,
        message: String,
    },
    Log {
        job_id: Uuid,
        level: LogLevel,
        message: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::StatusChanged { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Notification { job_id, .. }
            | Self::Log { job_id, .. } => *job_id,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Publish to all subscribers. Ok if nobody is listening.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
