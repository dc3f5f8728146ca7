//! Schema migrations for the libSQL backend, applied in version order and
//! recorded in `schema_migrations`.
//!
//! Hot job timestamps (`created_at`, `started_at`, heartbeats, queue
//! visibility) are stored as INTEGER unix milliseconds so staleness and
//! visibility checks are plain integer comparisons. Definitions and
//! documents use RFC 3339 text.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "job_tables",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                manager_id TEXT,
                job_type TEXT NOT NULL,
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                depth INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_manager ON jobs(manager_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_type ON jobs(job_type);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

            CREATE TABLE IF NOT EXISTS job_states (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                total INTEGER NOT NULL DEFAULT 0,
                pending INTEGER NOT NULL DEFAULT 0,
                running INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                completed_at INTEGER,
                error TEXT,
                result_count INTEGER NOT NULL DEFAULT 0,
                last_heartbeat INTEGER,
                result TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_states_status ON job_states(status);

            CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id);
        "#,
    },
    Migration {
        version: 2,
        name: "job_definitions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                schedule TEXT,
                next_fire_at TEXT,
                last_fired_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_definitions_next_fire
                ON job_definitions(next_fire_at);
        "#,
    },
    Migration {
        version: 3,
        name: "durable_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                job_id TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                visible_at INTEGER NOT NULL,
                received INTEGER NOT NULL DEFAULT 0,
                lease_token TEXT,
                enqueued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages(visible_at, seq);
            CREATE INDEX IF NOT EXISTS idx_queue_job ON queue_messages(job_id);

            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                job_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                received INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                dead_at INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 4,
        name: "documents",
        sql: r#"
            CREATE TABLE IF NOT EXISTS documents (
                url TEXT PRIMARY KEY,
                job_id TEXT,
                title TEXT,
                body TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_job ON documents(job_id);

            CREATE TABLE IF NOT EXISTS index_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                documents INTEGER NOT NULL,
                rebuilt_at TEXT NOT NULL
            );
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each pending migration runs in one transaction together with its
/// `schema_migrations` row, so a failed step leaves the previous version
/// intact and is retried on the next start.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create schema_migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Leave no half-applied transaction behind on the shared connection.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} {}: {e}",
                migration.version, migration.name
            )));
        }
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read_err = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await
        .map_err(read_err)?;
    match rows.next().await.map_err(read_err)? {
        Some(row) => row.get::<i64>(0).map_err(read_err),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "jobs",
            "job_states",
            "job_logs",
            "job_definitions",
            "queue_messages",
            "dead_letters",
            "documents",
            "index_state",
            "schema_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = schema_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().map(|m| m.version).unwrap());
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM schema_migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            seen.push((v, n));
        }
        assert_eq!(seen.len(), MIGRATIONS.len());
        assert_eq!(seen[0], (1, "job_tables".to_string()));
        assert_eq!(seen[2], (3, "durable_queue".to_string()));
    }
}
