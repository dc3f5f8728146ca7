//! `JobService`: read views and lifecycle actions over stored jobs.
//!
//! This is the surface an API layer sits on. Actions that start runs go
//! through the `Executor`, so a rerun or copy is an ordinary launch with
//! provenance in its metadata.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::executor::Executor;
use crate::jobs::model::JobRecord;
use crate::jobs::retention::{self, CleanupReport};
use crate::jobs::tree::JobTree;
use crate::runtime::Runtime;
use crate::store::traits::{GroupedJob, JobFilter, JobLogEntry, JobPage};

/// Default cap on returned log lines.
pub const DEFAULT_LOG_LIMIT: u32 = 500;

pub struct JobService {
    runtime: Runtime,
    executor: Arc<Executor>,
}

impl JobService {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            runtime: executor.runtime().clone(),
            executor,
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get(&self, id: Uuid) -> Result<JobRecord> {
        self.runtime.load(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        Ok(self.runtime.store.list_jobs(filter).await?)
    }

    pub async fn tree(&self, id: Uuid) -> Result<JobTree> {
        let root = self.runtime.load(id).await?;
        let descendants = self.runtime.store.list_descendants(id).await?;
        Ok(JobTree::build(root, descendants))
    }

    /// Root jobs with a recount of their work descendants.
    pub async fn grouped(&self, filter: &JobFilter) -> Result<Vec<GroupedJob>> {
        Ok(self.runtime.store.list_grouped(filter).await?)
    }

    pub async fn logs(
        &self,
        id: Uuid,
        include_descendants: bool,
        limit: Option<u32>,
    ) -> Result<Vec<JobLogEntry>> {
        self.runtime.load(id).await?;
        Ok(self
            .runtime
            .store
            .get_logs(id, include_descendants, limit.unwrap_or(DEFAULT_LOG_LIMIT))
            .await?)
    }

    // ── Actions ─────────────────────────────────────────────────────

    /// Cancel a job and its active descendants. Returns how many jobs were
    /// cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<u64> {
        let record = self.runtime.load(id).await?;
        if record.status().is_terminal() {
            return Err(JobError::InvalidState {
                id,
                state: record.status().to_string(),
                action: "cancel".to_string(),
                required: "pending or running".to_string(),
            }
            .into());
        }
        self.runtime.cancel_tree(id, "cancelled by request").await
    }

    /// Run a finished manager's definition again under a new id.
    pub async fn rerun(&self, id: Uuid) -> Result<Uuid> {
        let record = self.runtime.load(id).await?;
        let definition = record
            .job
            .config
            .as_definition()
            .ok_or_else(|| JobError::NotManager {
                id,
                action: "rerun".to_string(),
            })?
            .clone();
        if !record.status().is_terminal() {
            return Err(JobError::InvalidState {
                id,
                state: record.status().to_string(),
                action: "rerun".to_string(),
                required: "a terminal status".to_string(),
            }
            .into());
        }

        let new_id = self
            .executor
            .launch(&definition, Uuid::new_v4(), json!({ "rerun_of": id }))
            .await?;
        info!(job_id = %new_id, rerun_of = %id, "Job rerun");
        Ok(new_id)
    }

    /// Start a copy of any manager under a new id.
    pub async fn copy(&self, id: Uuid) -> Result<Uuid> {
        let record = self.runtime.load(id).await?;
        let mut definition = record
            .job
            .config
            .as_definition()
            .ok_or_else(|| JobError::NotManager {
                id,
                action: "copy".to_string(),
            })?
            .clone();
        definition.name = format!("{} (copy)", record.job.name);

        let new_id = self
            .executor
            .launch(&definition, Uuid::new_v4(), json!({ "copied_from": id }))
            .await?;
        info!(job_id = %new_id, copied_from = %id, "Job copied");
        Ok(new_id)
    }

    /// Delete a job with its descendants and logs. Rejected while the job or
    /// any descendant is pending or running. Ancestors' counters are then
    /// recounted so they no longer include the deleted rows.
    pub async fn delete(&self, id: Uuid) -> Result<u64> {
        let record = self.runtime.load(id).await?;
        let descendants = self.runtime.store.list_descendants(id).await?;
        if let Some(active) = std::iter::once(&record)
            .chain(&descendants)
            .find(|r| !r.status().is_terminal())
        {
            return Err(JobError::Active {
                id: active.id(),
                status: active.status().to_string(),
            }
            .into());
        }

        let deleted = self.runtime.store.delete_tree(id).await?;
        let mut parent_id = record.job.parent_id;
        while let Some(parent) = parent_id {
            self.runtime.store.reconcile_progress(parent).await?;
            parent_id = match self.runtime.store.get_job(parent).await? {
                Some(r) => r.job.parent_id,
                None => None,
            };
        }
        info!(job_id = %id, deleted, "Job deleted");
        Ok(deleted)
    }

    /// Run retention now with the configured or given settings.
    pub async fn cleanup(
        &self,
        max_age: Option<Duration>,
        dry_run: Option<bool>,
    ) -> Result<CleanupReport> {
        let retention = &self.runtime.config.retention;
        retention::cleanup(
            &self.runtime,
            max_age.unwrap_or(retention.max_age),
            dry_run.unwrap_or(retention.dry_run),
        )
        .await
    }
}
