//! Shared engine runtime: store, queue, event bus and config, plus the
//! transition helpers every handler goes through.
//!
//! All status changes funnel through `transition`, which is a
//! compare-and-swap in the store. Whoever wins the swap owns the follow-up:
//! arming the parent's completion probe or re-arming the manager's advance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, JobError, Result};
use crate::events::{EventBus, JobEvent};
use crate::jobs::config::CompletionMode;
use crate::jobs::model::{Job, JobRecord, JobStatus, error_text};
use crate::queue::{MessageQueue, QueueMessage};
use crate::store::traits::{JobLogEntry, JobStore, LogLevel};

/// Cloneable handle to the engine's shared services.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub events: EventBus,
    pub config: Arc<EngineConfig>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn MessageQueue>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            config: Arc::new(config),
        }
    }

    /// Load a job or fail with `JobError::NotFound`.
    pub async fn load(&self, id: Uuid) -> Result<JobRecord> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Compare-and-swap a status and publish the change.
    pub async fn transition(
        &self,
        job: &Job,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let error = error.map(error_text);
        let changed = self
            .store
            .update_status(job.id, from, to, error.as_deref())
            .await?;
        if changed {
            debug!(job_id = %job.id, job_type = job.job_type(), %from, %to, "Job transition");
            self.events.publish(JobEvent::StatusChanged {
                job_id: job.id,
                parent_id: job.parent_id,
                job_type: job.job_type().to_string(),
                from,
                to,
            });
        }
        Ok(changed)
    }

    /// Claim a pending job.
    pub async fn start(&self, job: &Job) -> Result<bool> {
        self.transition(job, JobStatus::Pending, JobStatus::Running, None)
            .await
    }

    /// Move a job to a terminal status, passing through running if it was
    /// still pending, then run the parent follow-up. Returns false when the
    /// job was already terminal.
    pub async fn finish(&self, job: &Job, to: JobStatus, error: Option<&str>) -> Result<bool> {
        if !self.settle(job, to, error).await? {
            return Ok(false);
        }
        self.after_terminal(job).await?;
        Ok(true)
    }

    /// Terminal transition without the parent follow-up.
    async fn settle(&self, job: &Job, to: JobStatus, error: Option<&str>) -> Result<bool> {
        if self.transition(job, JobStatus::Running, to, error).await? {
            return Ok(true);
        }
        if self.start(job).await? {
            return self.transition(job, JobStatus::Running, to, error).await;
        }
        Ok(false)
    }

    /// Fail a job by id, recording an error code in its metadata.
    pub async fn fail(&self, job_id: Uuid, error: &str, code: Option<&str>) -> Result<bool> {
        let Some(record) = self.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if let Some(code) = code {
            self.store
                .merge_metadata(job_id, &serde_json::json!({ "error_code": code }))
                .await?;
        }
        let failed = self
            .finish(&record.job, JobStatus::Failed, Some(error))
            .await?;
        if failed {
            self.log(job_id, LogLevel::Error, error).await;
        }
        Ok(failed)
    }

    /// Follow-up once a job reached a terminal status.
    ///
    /// Work jobs wake their step's completion probe when nothing is left in
    /// flight; steps wake their manager; managers announce completion.
    pub async fn after_terminal(&self, job: &Job) -> Result<()> {
        match job.depth {
            0 => {
                if let Some(record) = self.store.get_job(job.id).await? {
                    if record.status() != JobStatus::Completed {
                        let reason = format!("manager {}", record.status());
                        self.cancel_descendants(job.id, &reason).await?;
                    }
                    self.events.publish(JobEvent::Completed {
                        job_id: job.id,
                        status: record.status(),
                        possibly_incomplete: record.state.meta_bool("possibly_incomplete"),
                    });
                }
            }
            1 => {
                if let Some(manager) = job.manager_id {
                    self.arm_advance(manager, Duration::ZERO).await?;
                }
            }
            _ => {
                let Some(step) = self.step_of(job).await? else {
                    return Ok(());
                };
                let probe_managed = matches!(
                    step.job.config.as_step(),
                    Some((_, _, CompletionMode::Probe))
                );
                if probe_managed && step.status() == JobStatus::Running {
                    let summary = self.store.child_summary(step.id()).await?;
                    if summary.active() == 0 {
                        self.arm_probe(step.id(), self.config.probe.initial_delay)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The depth-1 ancestor of a work job.
    pub async fn step_of(&self, job: &Job) -> Result<Option<JobRecord>> {
        let mut parent_id = job.parent_id;
        while let Some(id) = parent_id {
            let Some(record) = self.store.get_job(id).await? else {
                return Ok(None);
            };
            if record.job.depth <= 1 {
                return Ok((record.job.depth == 1).then_some(record));
            }
            parent_id = record.job.parent_id;
        }
        Ok(None)
    }

    /// Cancel a job and every active descendant, and drop their queued
    /// messages. Returns how many jobs were cancelled.
    pub async fn cancel_tree(&self, root: Uuid, reason: &str) -> Result<u64> {
        let root_record = self.load(root).await?;
        let mut cancelled = self.cancel_descendants(root, reason).await?;

        if !root_record.status().is_terminal()
            && self
                .settle(&root_record.job, JobStatus::Cancelled, Some(reason))
                .await?
        {
            cancelled += 1;
        }
        self.queue.purge_jobs(&[root]).await?;
        self.log(root, LogLevel::Warn, &format!("Cancelled: {reason}"))
            .await;
        info!(job_id = %root, cancelled, "Job tree cancelled");

        if root_record.job.depth > 0 {
            self.after_terminal(&root_record.job).await?;
        }
        Ok(cancelled)
    }

    /// Cancel every active descendant of `root` (not `root` itself) and drop
    /// their queued messages.
    pub async fn cancel_descendants(&self, root: Uuid, reason: &str) -> Result<u64> {
        let mut records = self.store.list_descendants(root).await?;
        // Deepest first so parents never observe a half-cancelled subtree.
        records.reverse();

        let mut cancelled = 0;
        for record in records.iter().filter(|r| !r.status().is_terminal()) {
            if self
                .settle(&record.job, JobStatus::Cancelled, Some(reason))
                .await?
            {
                cancelled += 1;
            }
        }

        let ids: Vec<Uuid> = records.iter().map(|r| r.id()).collect();
        if !ids.is_empty() {
            self.queue.purge_jobs(&ids).await?;
        }
        Ok(cancelled)
    }

    // ── Children & messages ─────────────────────────────────────────

    /// Create a work job and queue it. Safe to repeat: an existing job is
    /// re-queued only while still pending.
    pub async fn spawn_work(&self, job: &Job) -> Result<bool> {
        let created = self.store.create_job(job).await?;
        let pending = if created {
            true
        } else {
            matches!(
                self.store.get_job(job.id).await?,
                Some(r) if r.status() == JobStatus::Pending
            )
        };
        if pending {
            self.queue.enqueue(&QueueMessage::work(job)).await?;
        }
        Ok(created)
    }

    pub async fn arm_probe(&self, step_id: Uuid, delay: Duration) -> Result<()> {
        self.queue
            .rearm(&QueueMessage::probe(step_id, serde_json::json!({})), delay)
            .await?;
        Ok(())
    }

    pub async fn arm_advance(&self, manager_id: Uuid, delay: Duration) -> Result<()> {
        self.queue
            .rearm(&QueueMessage::advance(manager_id), delay)
            .await?;
        Ok(())
    }

    // ── Logs ────────────────────────────────────────────────────────

    /// Persist a job log line and publish it. Failures are logged, never
    /// propagated.
    pub async fn log(&self, job_id: Uuid, level: LogLevel, message: &str) {
        let entry = JobLogEntry {
            job_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&entry).await {
            warn!(job_id = %job_id, "Failed to persist job log: {}", e);
        }
        self.events.publish(JobEvent::Log {
            job_id,
            level,
            message: entry.message,
        });
    }
}

/// Log an error that a background path can only report.
pub(crate) fn report(context: &str, e: &Error) {
    error!("{context}: {e}");
}
