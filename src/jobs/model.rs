//! Job records, status state machine and progress counters.
//!
//! A `Job` is immutable once created. Everything that changes while it runs
//! lives in its `JobState`, keyed by the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::config::JobConfig;

/// Maximum stored length of a job error message, in bytes.
pub const MAX_ERROR_LEN: usize = 2000;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created and waiting for a worker.
    Pending,
    /// Claimed by a worker (or, for parents, has work in flight).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by request.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Parse a status filter: a single status or a comma-separated OR set.
pub fn parse_status_filter(s: &str) -> Result<Vec<JobStatus>, String> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let status: JobStatus = part.parse()?;
        if !out.contains(&status) {
            out.push(status);
        }
    }
    Ok(out)
}

/// Aggregated counts of a job's work descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl Progress {
    /// Descendants that are pending or running.
    pub fn active(&self) -> i64 {
        self.pending + self.running
    }

    /// Descendants in a terminal status.
    pub fn finished(&self) -> i64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn count_for(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn apply(&mut self, delta: &ProgressDelta) {
        self.total += delta.total;
        self.pending += delta.pending;
        self.running += delta.running;
        self.completed += delta.completed;
        self.failed += delta.failed;
        self.cancelled += delta.cancelled;
    }
}

/// Signed change to a `Progress`, applied atomically by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl ProgressDelta {
    /// A new pending descendant.
    pub fn created() -> Self {
        Self {
            total: 1,
            pending: 1,
            ..Self::default()
        }
    }

    /// A descendant moved from one status to another.
    pub fn transition(from: JobStatus, to: JobStatus) -> Self {
        let mut delta = Self::default();
        *delta.slot(from) -= 1;
        *delta.slot(to) += 1;
        delta
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn slot(&mut self, status: JobStatus) -> &mut i64 {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }
}

/// Immutable description of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Root of the tree; `None` for the root itself.
    pub manager_id: Option<Uuid>,
    pub name: String,
    pub config: JobConfig,
    /// 0 = manager, 1 = step, 2+ = work.
    pub depth: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A root job with a fresh id.
    pub fn root(name: impl Into<String>, config: JobConfig) -> Self {
        Self::root_with_id(Uuid::new_v4(), name, config)
    }

    pub fn root_with_id(id: Uuid, name: impl Into<String>, config: JobConfig) -> Self {
        Self {
            id,
            parent_id: None,
            manager_id: None,
            name: name.into(),
            config,
            depth: 0,
            created_at: Utc::now(),
        }
    }

    /// A child of `parent` with the given id.
    pub fn child_of(parent: &Job, id: Uuid, name: impl Into<String>, config: JobConfig) -> Self {
        Self {
            id,
            parent_id: Some(parent.id),
            manager_id: Some(parent.manager_id.unwrap_or(parent.id)),
            name: name.into(),
            config,
            depth: parent.depth + 1,
            created_at: Utc::now(),
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.config.job_type()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Work jobs are the ones counted in ancestor progress.
    pub fn is_work(&self) -> bool {
        self.depth >= 2
    }

    /// The manager this job reports to (itself for a root).
    pub fn manager(&self) -> Uuid {
        self.manager_id.unwrap_or(self.id)
    }
}

/// Deterministic child id: the same parent and key always yield the same id,
/// so a handler that runs twice creates each child once.
pub fn child_id(parent: Uuid, key: &str) -> Uuid {
    Uuid::new_v5(&parent, key.as_bytes())
}

/// Mutable execution state of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: Progress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_count: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            progress: Progress::default(),
            started_at: None,
            completed_at: None,
            error: None,
            result_count: 0,
            last_heartbeat: None,
            result: None,
            metadata: serde_json::json!({}),
            updated_at: Utc::now(),
        }
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }
}

/// A job together with its current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub state: JobState,
}

impl JobRecord {
    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub fn status(&self) -> JobStatus {
        self.state.status
    }
}

/// Truncate to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Normalize an error for storage: never empty, bounded length.
pub fn error_text(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        "unknown error".to_string()
    } else {
        truncate(trimmed, MAX_ERROR_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_legal_edges() {
        use JobStatus::*;
        let legal = [
            (Pending, Running),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exit() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn status_filter_parsing() {
        let statuses = parse_status_filter("running, failed,running").unwrap();
        assert_eq!(statuses, vec![JobStatus::Running, JobStatus::Failed]);
        assert!(parse_status_filter("running,bogus").is_err());
        assert!(parse_status_filter("").unwrap().is_empty());
    }

    #[test]
    fn transition_delta_keeps_total() {
        let mut p = Progress::default();
        p.apply(&ProgressDelta::created());
        p.apply(&ProgressDelta::transition(JobStatus::Pending, JobStatus::Running));
        p.apply(&ProgressDelta::transition(JobStatus::Running, JobStatus::Failed));
        assert_eq!(p.total, 1);
        assert_eq!(p.active(), 0);
        assert_eq!(p.failed, 1);
        assert_eq!(p.finished() + p.active(), p.total);
    }

    #[test]
    fn child_ids_are_stable() {
        let parent = Uuid::new_v4();
        assert_eq!(child_id(parent, "https://a/"), child_id(parent, "https://a/"));
        assert_ne!(child_id(parent, "https://a/"), child_id(parent, "https://b/"));
    }

    #[test]
    fn error_text_is_bounded_and_nonempty() {
        assert_eq!(error_text("  "), "unknown error");
        let long = "é".repeat(MAX_ERROR_LEN);
        let out = error_text(&long);
        assert!(out.len() <= MAX_ERROR_LEN);
        assert!(out.is_char_boundary(out.len()));
    }
}
