//! `JobStore` trait: single async interface for job persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::definition::JobDefinition;
use crate::jobs::model::{Job, JobRecord, JobStatus, Progress, ProgressDelta};

/// Which parent a listing is scoped to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParentFilter {
    /// Any job.
    #[default]
    Any,
    /// Root jobs only.
    Root,
    /// Direct children of one job.
    Id(Uuid),
}

impl std::str::FromStr for ParentFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "any" => Ok(Self::Any),
            "root" => Ok(Self::Root),
            other => Uuid::parse_str(other)
                .map(Self::Id)
                .map_err(|e| format!("invalid parent filter {other}: {e}")),
        }
    }
}

/// Listing filter. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub parent: ParentFilter,
    /// OR set; empty means any status.
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl JobFilter {
    pub fn roots() -> Self {
        Self {
            parent: ParentFilter::Root,
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<JobStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }
}

/// One page of a listing plus the unpaginated match count.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub total_count: u64,
}

/// A root job with a recount of its work descendants.
#[derive(Debug, Clone, Serialize)]
pub struct GroupedJob {
    pub root: JobRecord,
    pub children: Progress,
}

/// Severity of a persisted job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// A persisted log line attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A stored definition with its scheduling state.
#[derive(Debug, Clone)]
pub struct DefinitionRecord {
    pub definition: JobDefinition,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a job and its pending state if the id is not taken yet.
    /// Returns whether a row was created. A new work job is counted in
    /// every ancestor's progress.
    async fn create_job(&self, job: &Job) -> Result<bool, DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, DatabaseError>;

    /// Direct children, oldest first.
    async fn list_children(&self, parent: Uuid) -> Result<Vec<JobRecord>, DatabaseError>;

    /// All descendants (not including `root`), ordered by depth then age.
    async fn list_descendants(&self, root: Uuid) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Root jobs paired with a recount of their work descendants.
    async fn list_grouped(&self, filter: &JobFilter) -> Result<Vec<GroupedJob>, DatabaseError>;

    /// Compare-and-swap a status. Returns false when the job was not in
    /// `from`. Sets start/end timestamps and the error, and applies the
    /// status delta to every ancestor for work jobs.
    async fn update_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Atomically add `delta` to one job's counters and bump its heartbeat.
    async fn increment_progress(&self, id: Uuid, delta: &ProgressDelta)
    -> Result<(), DatabaseError>;

    /// Authoritative recount of work descendants grouped by status.
    async fn child_summary(&self, id: Uuid) -> Result<Progress, DatabaseError>;

    /// Overwrite counters with the recount; returns it.
    async fn reconcile_progress(&self, id: Uuid) -> Result<Progress, DatabaseError>;

    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn set_result(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        result_count: i64,
    ) -> Result<(), DatabaseError>;

    /// Shallow-merge keys into the metadata object. `null` values remove keys.
    async fn merge_metadata(&self, id: Uuid, patch: &serde_json::Value)
    -> Result<(), DatabaseError>;

    /// Delete a job, its descendants, their logs and their queued messages.
    /// Returns the number of jobs deleted.
    async fn delete_tree(&self, id: Uuid) -> Result<u64, DatabaseError>;

    /// Terminal root jobs created before `cutoff`.
    async fn list_expired_roots(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<JobRecord>, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, entry: &JobLogEntry) -> Result<(), DatabaseError>;

    /// Logs of a job, optionally merged with all its descendants', oldest first.
    async fn get_logs(
        &self,
        job_id: Uuid,
        include_descendants: bool,
        limit: u32,
    ) -> Result<Vec<JobLogEntry>, DatabaseError>;

    // ── Definitions ─────────────────────────────────────────────────

    async fn save_definition(&self, def: &JobDefinition) -> Result<(), DatabaseError>;

    async fn get_definition(&self, id: &str) -> Result<Option<JobDefinition>, DatabaseError>;

    async fn list_definitions(&self) -> Result<Vec<DefinitionRecord>, DatabaseError>;

    async fn delete_definition(&self, id: &str) -> Result<bool, DatabaseError>;

    async fn set_definition_schedule(
        &self,
        id: &str,
        next_fire_at: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;
}
