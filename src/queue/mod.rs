//! Durable at-least-once message queue.
//!
//! A received message is leased: invisible to other receivers until it is
//! deleted or the lease runs out, at which point it is delivered again.
//! Every delivery bumps a receive count; past the configured maximum the
//! message is moved to the dead-letter table instead of being redelivered.
//!
//! Message ids are chosen by the caller. Enqueueing an id that is already
//! queued is a no-op, which makes fan-out and chaining idempotent when ids
//! are derived from the work they stand for.

mod libsql_queue;

pub use libsql_queue::LibSqlQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::model::Job;

/// Message kinds that are not job types.
pub mod kinds {
    /// Walk a manager's steps.
    pub const ADVANCE: &str = "advance";
    /// Check whether a fan-out step has finished.
    pub const PROBE: &str = "probe";
    /// Drive a plan/execute/review step.
    pub const ORCHESTRATE: &str = "orchestrate";
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    /// Handler routing key.
    pub kind: String,
    /// Job the message acts on.
    pub job_id: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueueMessage {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        job_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            job_id,
            payload,
        }
    }

    /// Run a work job. The id is the job id, so a job is queued at most once.
    pub fn work(job: &Job) -> Self {
        Self::new(
            job.id.to_string(),
            job.job_type(),
            job.id,
            serde_json::json!({}),
        )
    }

    pub fn advance(manager_id: Uuid) -> Self {
        Self::new(
            format!("advance:{manager_id}"),
            kinds::ADVANCE,
            manager_id,
            serde_json::json!({}),
        )
    }

    pub fn probe(step_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(format!("probe:{step_id}"), kinds::PROBE, step_id, payload)
    }

    pub fn orchestrate(step_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(
            format!("orchestrate:{step_id}"),
            kinds::ORCHESTRATE,
            step_id,
            payload,
        )
    }
}

/// A message held under a lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub message: QueueMessage,
    /// Proof of ownership; operations with a stale token are ignored.
    pub token: String,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of a receive.
#[derive(Debug, Clone)]
pub enum Delivery {
    Leased(Lease),
    /// Exceeded the receive limit; already moved out of the queue.
    DeadLettered {
        message: QueueMessage,
        receive_count: u32,
    },
}

/// A message parked in the dead-letter table.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub receive_count: u32,
    pub dead_at: DateTime<Utc>,
}

/// Persistent message queue with leases.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue a message, visible immediately. Returns false when the id is
    /// already queued.
    async fn enqueue(&self, msg: &QueueMessage) -> Result<bool, QueueError> {
        self.enqueue_with_delay(msg, Duration::ZERO).await
    }

    async fn enqueue_with_delay(
        &self,
        msg: &QueueMessage,
        delay: Duration,
    ) -> Result<bool, QueueError>;

    /// Schedule a message, or reuse the queued one with the same id: it
    /// becomes visible after `delay` with a fresh payload and any current
    /// lease voided.
    async fn rearm(&self, msg: &QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Lease the next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge. Returns false when the lease was lost.
    async fn delete(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Push the lease deadline out by `by` from now.
    async fn extend(&self, lease: &Lease, by: Duration) -> Result<bool, QueueError>;

    /// Give the message back to run again after `delay`, optionally with a
    /// new payload. Resets the receive count.
    async fn requeue(
        &self,
        lease: &Lease,
        delay: Duration,
        payload: Option<&serde_json::Value>,
    ) -> Result<bool, QueueError>;

    /// Give the message back after a failed attempt. The receive count is
    /// kept so repeated failures end in the dead-letter table.
    async fn release(&self, lease: &Lease, delay: Duration) -> Result<bool, QueueError>;

    /// Drop all messages for the given jobs. Returns the number removed.
    async fn purge_jobs(&self, job_ids: &[Uuid]) -> Result<u64, QueueError>;

    async fn contains(&self, id: &str) -> Result<bool, QueueError>;

    /// Queued messages, leased or not.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, QueueError>;
}
