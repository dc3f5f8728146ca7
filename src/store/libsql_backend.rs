//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. All counter updates are
//! single SQL statements (`SET x = x + ?`) so concurrent workers never lose
//! increments, and status changes are compare-and-swap on the current value.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::documents::{Document, DocumentSink, IndexStats, SearchIndex};
use crate::error::DatabaseError;
use crate::jobs::config::JobConfig;
use crate::jobs::definition::JobDefinition;
use crate::jobs::model::{Job, JobRecord, JobState, JobStatus, Progress, ProgressDelta};
use crate::queue::LibSqlQueue;
use crate::store::migrations;
use crate::store::traits::{
    DefinitionRecord, GroupedJob, JobFilter, JobLogEntry, JobPage, JobStore, LogLevel,
    ParentFilter,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// A queue sharing this database's connection.
    pub fn queue(&self, config: QueueConfig) -> LibSqlQueue {
        LibSqlQueue::from_connection(Arc::clone(&self.db), self.conn.clone(), config)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Ids of `root` and all its descendants.
    async fn subtree_ids(&self, root: Uuid) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "WITH RECURSIVE d(id) AS (
                    SELECT ?1
                    UNION ALL
                    SELECT j.id FROM jobs j JOIN d ON j.parent_id = d.id
                 )
                 SELECT id FROM d",
                params![root.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("subtree_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("subtree_ids: {e}")))?
        {
            ids.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("subtree_ids: {e}")))?,
            );
        }
        Ok(ids)
    }

    /// Apply a delta to every ancestor of a work job.
    async fn increment_ancestors(
        &self,
        id: Uuid,
        delta: &ProgressDelta,
    ) -> Result<(), DatabaseError> {
        if delta.is_zero() {
            return Ok(());
        }
        let now = now_ms();
        self.conn()
            .execute(
                "WITH RECURSIVE anc(id) AS (
                    SELECT parent_id FROM jobs WHERE id = ?1 AND depth >= 2 AND parent_id IS NOT NULL
                    UNION
                    SELECT j.parent_id FROM jobs j JOIN anc ON j.id = anc.id WHERE j.parent_id IS NOT NULL
                 )
                 UPDATE job_states SET
                    total = total + ?2,
                    pending = pending + ?3,
                    running = running + ?4,
                    completed = completed + ?5,
                    failed = failed + ?6,
                    cancelled = cancelled + ?7,
                    last_heartbeat = ?8,
                    updated_at = ?8
                 WHERE job_id IN (SELECT id FROM anc)",
                params![
                    id.to_string(),
                    delta.total,
                    delta.pending,
                    delta.running,
                    delta.completed,
                    delta.failed,
                    delta.cancelled,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_ancestors: {e}")))?;
        Ok(())
    }

    async fn query_records(
        &self,
        sql: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(params))
            .await
            .map_err(|e| DatabaseError::Query(format!("query_records: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query_records: {e}")))?
        {
            out.push(row_to_record(&row)?);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

const JOB_COLUMNS: &str = "j.id, j.parent_id, j.manager_id, j.name, j.config, j.depth, j.created_at, \
     s.status, s.total, s.pending, s.running, s.completed, s.failed, s.cancelled, \
     s.started_at, s.completed_at, s.error, s.result_count, s.last_heartbeat, s.result, \
     s.metadata, s.updated_at";

const JOB_FROM: &str = "FROM jobs j JOIN job_states s ON s.job_id = j.id";

/// Map a libsql Row to a JobRecord.
///
/// Column order matches JOB_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_record: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let parent_id: Option<String> = row.get(1).ok();
    let manager_id: Option<String> = row.get(2).ok();
    let name: String = row.get(3).map_err(get_err)?;
    let config_str: String = row.get(4).map_err(get_err)?;
    let depth: i64 = row.get(5).map_err(get_err)?;
    let created_at: i64 = row.get(6).map_err(get_err)?;
    let status_str: String = row.get(7).map_err(get_err)?;

    let config: JobConfig = serde_json::from_str(&config_str)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} config: {e}")))?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;

    let job_id = parse_uuid(&id)?;
    let job = Job {
        id: job_id,
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        manager_id: manager_id.as_deref().map(parse_uuid).transpose()?,
        name,
        config,
        depth: depth as u32,
        created_at: ms_to_datetime(created_at),
    };

    let progress = Progress {
        total: row.get(8).map_err(get_err)?,
        pending: row.get(9).map_err(get_err)?,
        running: row.get(10).map_err(get_err)?,
        completed: row.get(11).map_err(get_err)?,
        failed: row.get(12).map_err(get_err)?,
        cancelled: row.get(13).map_err(get_err)?,
    };

    let result_str: Option<String> = row.get(19).ok();
    let metadata_str: String = row.get(20).unwrap_or_else(|_| "{}".to_string());
    let updated_at: i64 = row.get(21).map_err(get_err)?;

    let state = JobState {
        job_id,
        status,
        progress,
        started_at: row.get::<i64>(14).ok().map(ms_to_datetime),
        completed_at: row.get::<i64>(15).ok().map(ms_to_datetime),
        error: row.get(16).ok(),
        result_count: row.get(17).map_err(get_err)?,
        last_heartbeat: row.get::<i64>(18).ok().map(ms_to_datetime),
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_else(|_| serde_json::json!({})),
        updated_at: ms_to_datetime(updated_at),
    };

    Ok(JobRecord { job, state })
}

/// Build the WHERE clause and params for a listing filter.
fn filter_clause(filter: &JobFilter) -> (String, Vec<libsql::Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<libsql::Value> = Vec::new();

    match filter.parent {
        ParentFilter::Any => {}
        ParentFilter::Root => clauses.push("j.parent_id IS NULL".into()),
        ParentFilter::Id(parent) => {
            clauses.push("j.parent_id = ?".into());
            params.push(libsql::Value::Text(parent.to_string()));
        }
    }
    if !filter.statuses.is_empty() {
        let marks = vec!["?"; filter.statuses.len()].join(", ");
        clauses.push(format!("s.status IN ({marks})"));
        params.extend(
            filter
                .statuses
                .iter()
                .map(|s| libsql::Value::Text(s.as_str().to_string())),
        );
    }
    if let Some(job_type) = &filter.job_type {
        clauses.push("j.job_type = ?".into());
        params.push(libsql::Value::Text(job_type.clone()));
    }
    if let Some(after) = filter.created_after {
        clauses.push("j.created_at >= ?".into());
        params.push(libsql::Value::Integer(after.timestamp_millis()));
    }
    if let Some(before) = filter.created_before {
        clauses.push("j.created_at < ?".into());
        params.push(libsql::Value::Integer(before.timestamp_millis()));
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (sql, params)
}

fn row_to_definition(row: &libsql::Row) -> Result<DefinitionRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_definition: {e}"));
    let raw: String = row.get(0).map_err(get_err)?;
    let next_fire: Option<String> = row.get(1).ok();
    let last_fired: Option<String> = row.get(2).ok();
    let updated: String = row.get(3).map_err(get_err)?;

    let definition: JobDefinition = serde_json::from_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("definition: {e}")))?;

    Ok(DefinitionRecord {
        definition,
        next_fire_at: parse_optional_datetime(&next_fire),
        last_fired_at: parse_optional_datetime(&last_fired),
        updated_at: parse_datetime(&updated),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let config = serde_json::to_string(&job.config)
            .map_err(|e| DatabaseError::Serialization(format!("job config: {e}")))?;
        let now = now_ms();

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO jobs (id, parent_id, manager_id, job_type, name, config, depth, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.to_string(),
                    opt_text_owned(job.parent_id.map(|p| p.to_string())),
                    opt_text_owned(job.manager_id.map(|m| m.to_string())),
                    job.job_type(),
                    job.name.as_str(),
                    config,
                    job.depth as i64,
                    job.created_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        // Always attempted so a half-finished earlier insert is repaired.
        conn.execute(
            "INSERT OR IGNORE INTO job_states (job_id, status, metadata, updated_at)
             VALUES (?1, 'pending', '{}', ?2)",
            params![job.id.to_string(), now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_job state: {e}")))?;

        if inserted == 0 {
            return Ok(false);
        }

        if job.is_work() {
            self.increment_ancestors(job.id, &ProgressDelta::created())
                .await?;
        }

        debug!(job_id = %job.id, job_type = job.job_type(), "Job created");
        Ok(true)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let sql = format!("SELECT {JOB_COLUMNS} {JOB_FROM} WHERE j.id = ?1");
        let mut records = self
            .query_records(&sql, vec![libsql::Value::Text(id.to_string())])
            .await?;
        Ok(records.pop())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, DatabaseError> {
        let (where_sql, params) = filter_clause(filter);

        let count_sql = format!("SELECT COUNT(*) {JOB_FROM} {where_sql}");
        let mut rows = self
            .conn()
            .query(&count_sql, libsql::params::Params::Positional(params.clone()))
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs count: {e}")))?;
        let total_count = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs count: {e}")))?
        {
            Some(row) => row.get::<i64>(0).unwrap_or(0) as u64,
            None => 0,
        };

        let mut page_params = params;
        page_params.push(libsql::Value::Integer(
            filter.limit.map(i64::from).unwrap_or(-1),
        ));
        page_params.push(libsql::Value::Integer(i64::from(filter.offset)));

        let sql = format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM} {where_sql}
             ORDER BY j.created_at DESC, j.id DESC LIMIT ? OFFSET ?"
        );
        let jobs = self.query_records(&sql, page_params).await?;

        Ok(JobPage { jobs, total_count })
    }

    async fn list_children(&self, parent: Uuid) -> Result<Vec<JobRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM} WHERE j.parent_id = ?1 ORDER BY j.created_at, j.id"
        );
        self.query_records(&sql, vec![libsql::Value::Text(parent.to_string())])
            .await
    }

    async fn list_descendants(&self, root: Uuid) -> Result<Vec<JobRecord>, DatabaseError> {
        let sql = format!(
            "WITH RECURSIVE d(id) AS (
                SELECT id FROM jobs WHERE parent_id = ?1
                UNION ALL
                SELECT j.id FROM jobs j JOIN d ON j.parent_id = d.id
             )
             SELECT {JOB_COLUMNS} {JOB_FROM} WHERE j.id IN (SELECT id FROM d)
             ORDER BY j.depth, j.created_at, j.id"
        );
        self.query_records(&sql, vec![libsql::Value::Text(root.to_string())])
            .await
    }

    async fn list_grouped(&self, filter: &JobFilter) -> Result<Vec<GroupedJob>, DatabaseError> {
        let roots_only = JobFilter {
            parent: ParentFilter::Root,
            ..filter.clone()
        };
        let page = self.list_jobs(&roots_only).await?;

        let mut grouped = Vec::with_capacity(page.jobs.len());
        for root in page.jobs {
            let children = self.child_summary(root.id()).await?;
            grouped.push(GroupedJob { root, children });
        }
        Ok(grouped)
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !from.can_transition_to(to) {
            return Err(DatabaseError::Constraint(format!(
                "illegal status transition {from} -> {to} for job {id}"
            )));
        }

        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE job_states SET
                    status = ?2,
                    started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?4 ELSE started_at END,
                    completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled') THEN ?4 ELSE completed_at END,
                    error = COALESCE(?5, error),
                    last_heartbeat = ?4,
                    updated_at = ?4
                 WHERE job_id = ?1 AND status = ?3",
                params![
                    id.to_string(),
                    to.as_str(),
                    from.as_str(),
                    now,
                    opt_text_owned(error.map(str::to_string)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if changed == 0 {
            return Ok(false);
        }

        self.increment_ancestors(id, &ProgressDelta::transition(from, to))
            .await?;
        Ok(true)
    }

    async fn increment_progress(
        &self,
        id: Uuid,
        delta: &ProgressDelta,
    ) -> Result<(), DatabaseError> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE job_states SET
                    total = total + ?2,
                    pending = pending + ?3,
                    running = running + ?4,
                    completed = completed + ?5,
                    failed = failed + ?6,
                    cancelled = cancelled + ?7,
                    last_heartbeat = ?8,
                    updated_at = ?8
                 WHERE job_id = ?1",
                params![
                    id.to_string(),
                    delta.total,
                    delta.pending,
                    delta.running,
                    delta.completed,
                    delta.failed,
                    delta.cancelled,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_progress: {e}")))?;
        Ok(())
    }

    async fn child_summary(&self, id: Uuid) -> Result<Progress, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "WITH RECURSIVE d(id) AS (
                    SELECT id FROM jobs WHERE parent_id = ?1
                    UNION ALL
                    SELECT j.id FROM jobs j JOIN d ON j.parent_id = d.id
                 )
                 SELECT s.status, COUNT(*)
                 FROM d JOIN jobs j ON j.id = d.id JOIN job_states s ON s.job_id = d.id
                 WHERE j.depth >= 2
                 GROUP BY s.status",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("child_summary: {e}")))?;

        let mut summary = Progress::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("child_summary: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("child_summary: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => summary.pending = count,
                Ok(JobStatus::Running) => summary.running = count,
                Ok(JobStatus::Completed) => summary.completed = count,
                Ok(JobStatus::Failed) => summary.failed = count,
                Ok(JobStatus::Cancelled) => summary.cancelled = count,
                Err(e) => return Err(DatabaseError::Serialization(e)),
            }
            summary.total += count;
        }
        Ok(summary)
    }

    async fn reconcile_progress(&self, id: Uuid) -> Result<Progress, DatabaseError> {
        let summary = self.child_summary(id).await?;
        self.conn()
            .execute(
                "UPDATE job_states SET
                    total = ?2, pending = ?3, running = ?4,
                    completed = ?5, failed = ?6, cancelled = ?7,
                    updated_at = ?8
                 WHERE job_id = ?1",
                params![
                    id.to_string(),
                    summary.total,
                    summary.pending,
                    summary.running,
                    summary.completed,
                    summary.failed,
                    summary.cancelled,
                    now_ms(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reconcile_progress: {e}")))?;
        Ok(summary)
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE job_states SET last_heartbeat = ?2, updated_at = ?2 WHERE job_id = ?1",
                params![id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_heartbeat: {e}")))?;
        Ok(())
    }

    async fn set_result(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        result_count: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE job_states SET result = ?2, result_count = ?3, updated_at = ?4 WHERE job_id = ?1",
                params![id.to_string(), result.to_string(), result_count, now_ms()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_result: {e}")))?;
        Ok(())
    }

    async fn merge_metadata(
        &self,
        id: Uuid,
        patch: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        if !patch.is_object() {
            return Err(DatabaseError::Serialization(
                "metadata patch must be a JSON object".into(),
            ));
        }
        self.conn()
            .execute(
                "UPDATE job_states SET metadata = json_patch(metadata, ?2), updated_at = ?3
                 WHERE job_id = ?1",
                params![id.to_string(), patch.to_string(), now_ms()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("merge_metadata: {e}")))?;
        Ok(())
    }

    async fn delete_tree(&self, id: Uuid) -> Result<u64, DatabaseError> {
        let ids = self.subtree_ids(id).await?;
        let ids_json = serde_json::to_string(&ids)
            .map_err(|e| DatabaseError::Serialization(format!("delete_tree: {e}")))?;
        let conn = self.conn();

        for (table, column) in [
            ("job_logs", "job_id"),
            ("queue_messages", "job_id"),
            ("job_states", "job_id"),
        ] {
            conn.execute(
                &format!("DELETE FROM {table} WHERE {column} IN (SELECT value FROM json_each(?1))"),
                params![ids_json.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_tree {table}: {e}")))?;
        }

        let deleted = conn
            .execute(
                "DELETE FROM jobs WHERE id IN (SELECT value FROM json_each(?1))",
                params![ids_json.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_tree jobs: {e}")))?;

        info!(job_id = %id, deleted, "Deleted job tree");
        Ok(deleted)
    }

    async fn list_expired_roots(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.parent_id IS NULL
               AND s.status IN ('completed', 'failed', 'cancelled')
               AND j.created_at < ?1
             ORDER BY j.created_at"
        );
        self.query_records(&sql, vec![libsql::Value::Integer(cutoff.timestamp_millis())])
            .await
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, entry: &JobLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO job_logs (job_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.job_id.to_string(),
                    entry.level.as_str(),
                    entry.message.as_str(),
                    entry.created_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        Ok(())
    }

    async fn get_logs(
        &self,
        job_id: Uuid,
        include_descendants: bool,
        limit: u32,
    ) -> Result<Vec<JobLogEntry>, DatabaseError> {
        let sql = if include_descendants {
            "WITH RECURSIVE d(id) AS (
                SELECT ?1
                UNION ALL
                SELECT j.id FROM jobs j JOIN d ON j.parent_id = d.id
             )
             SELECT job_id, level, message, created_at FROM job_logs
             WHERE job_id IN (SELECT id FROM d)
             ORDER BY created_at, id LIMIT ?2"
        } else {
            "SELECT job_id, level, message, created_at FROM job_logs
             WHERE job_id = ?1 ORDER BY created_at, id LIMIT ?2"
        };

        let mut rows = self
            .conn()
            .query(sql, params![job_id.to_string(), i64::from(limit)])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_logs: {e}")))?
        {
            let get_err = |e: libsql::Error| DatabaseError::Query(format!("get_logs: {e}"));
            let id: String = row.get(0).map_err(get_err)?;
            let level: String = row.get(1).map_err(get_err)?;
            let created: i64 = row.get(3).map_err(get_err)?;
            logs.push(JobLogEntry {
                job_id: parse_uuid(&id)?,
                level: LogLevel::parse(&level),
                message: row.get(2).map_err(get_err)?,
                created_at: ms_to_datetime(created),
            });
        }
        Ok(logs)
    }

    // ── Definitions ─────────────────────────────────────────────────

    async fn save_definition(&self, def: &JobDefinition) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(def)
            .map_err(|e| DatabaseError::Serialization(format!("definition: {e}")))?;
        let now = Utc::now().to_rfc3339();

        // A changed schedule clears the stored fire time so it is recomputed.
        self.conn()
            .execute(
                "INSERT INTO job_definitions (id, name, definition, enabled, schedule, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    definition = excluded.definition,
                    enabled = excluded.enabled,
                    next_fire_at = CASE WHEN job_definitions.schedule IS excluded.schedule
                                        THEN job_definitions.next_fire_at ELSE NULL END,
                    schedule = excluded.schedule,
                    updated_at = excluded.updated_at",
                params![
                    def.id.as_str(),
                    def.name.as_str(),
                    raw,
                    def.enabled as i64,
                    opt_text_owned(def.schedule.clone()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_definition: {e}")))?;
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<JobDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT definition, next_fire_at, last_fired_at, updated_at
                 FROM job_definitions WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_definition: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_definition: {e}")))?
        {
            Some(row) => Ok(Some(row_to_definition(&row)?.definition)),
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<DefinitionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT definition, next_fire_at, last_fired_at, updated_at
                 FROM job_definitions ORDER BY id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_definitions: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_definitions: {e}")))?
        {
            out.push(row_to_definition(&row)?);
        }
        Ok(out)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM job_definitions WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_definition: {e}")))?;
        Ok(deleted > 0)
    }

    async fn set_definition_schedule(
        &self,
        id: &str,
        next_fire_at: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE job_definitions SET
                    next_fire_at = ?2,
                    last_fired_at = COALESCE(?3, last_fired_at)
                 WHERE id = ?1",
                params![
                    id,
                    opt_text_owned(next_fire_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(last_fired_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_definition_schedule: {e}")))?;
        Ok(())
    }
}

// ── Documents ───────────────────────────────────────────────────────

#[async_trait]
impl DocumentSink for LibSqlBackend {
    async fn save_document(&self, doc: &Document) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO documents (url, job_id, title, body, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(url) DO UPDATE SET
                    job_id = excluded.job_id,
                    title = excluded.title,
                    body = excluded.body,
                    fetched_at = excluded.fetched_at",
                params![
                    doc.url.as_str(),
                    opt_text_owned(doc.job_id.map(|j| j.to_string())),
                    opt_text_owned(doc.title.clone()),
                    doc.body.as_str(),
                    doc.fetched_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_document: {e}")))?;
        Ok(())
    }

    async fn document_count(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM documents", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("document_count: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("document_count: {e}")))?
        {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl SearchIndex for LibSqlBackend {
    async fn rebuild(&self) -> Result<IndexStats, DatabaseError> {
        let conn = self.conn();
        conn.execute("REINDEX documents", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("rebuild: {e}")))?;

        let documents = self.document_count().await?;
        let rebuilt_at = Utc::now();
        conn.execute(
            "INSERT INTO index_state (id, documents, rebuilt_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET documents = excluded.documents, rebuilt_at = excluded.rebuilt_at",
            params![documents as i64, rebuilt_at.to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("rebuild state: {e}")))?;

        info!(documents, "Search index rebuilt");
        Ok(IndexStats {
            documents,
            rebuilt_at,
        })
    }
}
