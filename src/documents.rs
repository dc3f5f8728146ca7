//! Document sink and search index seams.
//!
//! Crawl jobs hand fetched pages to a `DocumentSink`; the reindex step calls
//! `SearchIndex::rebuild`. The libSQL backend implements both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;

/// A fetched page ready to be stored.
#[derive(Debug, Clone)]
pub struct Document {
    pub url: String,
    pub title: Option<String>,
    pub body: String,
    /// Job that fetched it.
    pub job_id: Option<Uuid>,
    pub fetched_at: DateTime<Utc>,
}

/// Where crawled documents are persisted.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Insert or replace by URL.
    async fn save_document(&self, doc: &Document) -> Result<(), DatabaseError>;

    async fn document_count(&self) -> Result<u64, DatabaseError>;
}

/// Result of an index rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: u64,
    pub rebuilt_at: DateTime<Utc>,
}

/// Full-text index over stored documents.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn rebuild(&self) -> Result<IndexStats, DatabaseError>;
}
