//! Work job adapter.
//!
//! `WorkJobHandler` wraps a `WorkHandler` and owns the job's lifecycle:
//! claim the pending job, run it under the job timeout, store the result
//! and settle the final status. The wrapped handler only does the work.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::jobs::model::{JobRecord, JobStatus};
use crate::queue::Lease;
use crate::runtime::Runtime;
use crate::worker::handler::{HandlerOutcome, MessageHandler};

/// What a work job produced.
#[derive(Debug, Clone, Default)]
pub struct WorkOutput {
    pub result: Option<serde_json::Value>,
    pub result_count: i64,
}

impl WorkOutput {
    pub fn with_result(result: serde_json::Value, result_count: i64) -> Self {
        Self {
            result: Some(result),
            result_count,
        }
    }
}

/// Everything a work handler gets to see.
pub struct WorkContext {
    pub runtime: Runtime,
    pub record: JobRecord,
    /// Delivery attempt of the underlying message, starting at 1.
    pub attempt: u32,
}

/// Does the work of one job type.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn run(&self, ctx: &WorkContext) -> Result<WorkOutput, HandlerError>;
}

/// Routes work messages of one job type to a `WorkHandler`.
pub struct WorkJobHandler {
    runtime: Runtime,
    inner: Arc<dyn WorkHandler>,
}

impl WorkJobHandler {
    pub fn new(runtime: Runtime, inner: Arc<dyn WorkHandler>) -> Self {
        Self { runtime, inner }
    }

    /// Whether the job is gone or terminal in the store right now.
    async fn finished(&self, job_id: Uuid) -> Result<bool, HandlerError> {
        Ok(self
            .runtime
            .store
            .get_job(job_id)
            .await?
            .is_none_or(|r| r.status().is_terminal()))
    }
}

#[async_trait]
impl MessageHandler for WorkJobHandler {
    fn kind(&self) -> &str {
        self.inner.job_type()
    }

    async fn handle(&self, lease: &Lease) -> Result<HandlerOutcome, HandlerError> {
        let job_id = lease.message.job_id;
        let Some(record) = self.runtime.store.get_job(job_id).await? else {
            warn!(job_id = %job_id, "Work message for a missing job, dropping");
            return Ok(HandlerOutcome::Done);
        };

        match record.status() {
            status if status.is_terminal() => {
                debug!(job_id = %job_id, %status, "Job already finished, dropping message");
                return Ok(HandlerOutcome::Done);
            }
            JobStatus::Pending => {
                if !self.runtime.start(&record.job).await? && self.finished(job_id).await? {
                    debug!(job_id = %job_id, "Job finished before it started, dropping message");
                    return Ok(HandlerOutcome::Done);
                }
            }
            // Redelivery after a crash or lost lease: run again.
            _ => {
                info!(job_id = %job_id, attempt = lease.receive_count, "Resuming running job");
            }
        }
        self.runtime.store.touch_heartbeat(job_id).await?;

        let job = record.job.clone();
        let ctx = WorkContext {
            runtime: self.runtime.clone(),
            record,
            attempt: lease.receive_count,
        };

        let timeout = self.runtime.config.worker.job_timeout;
        let output = match tokio::time::timeout(timeout, self.inner.run(&ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HandlerError::Terminal(format!(
                    "job timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        // Cancelled while running: the cancel already settled the job.
        if self.finished(job_id).await? {
            debug!(job_id = %job_id, "Job finished while running, discarding output");
            return Ok(HandlerOutcome::Done);
        }

        if let Some(result) = &output.result {
            self.runtime
                .store
                .set_result(job_id, result, output.result_count)
                .await?;
        }
        self.runtime
            .finish(&job, JobStatus::Completed, None)
            .await?;
        Ok(HandlerOutcome::Done)
    }
}
