//! Retention: delete terminal root jobs past their age.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{ConfigError, Result};
use crate::runtime::Runtime;

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Root jobs that matched the cutoff.
    pub candidates: Vec<Uuid>,
    /// Jobs deleted, descendants included. Zero on a dry run.
    pub deleted: u64,
}

/// Delete every terminal root job created more than `max_age` ago, with its
/// whole tree. A dry run only reports the candidates.
pub async fn cleanup(runtime: &Runtime, max_age: Duration, dry_run: bool) -> Result<CleanupReport> {
    let max_age = chrono::Duration::from_std(max_age).map_err(|e| ConfigError::InvalidValue {
        key: "retention max_age".to_string(),
        message: e.to_string(),
    })?;
    let cutoff = Utc::now() - max_age;
    let expired = runtime.store.list_expired_roots(cutoff).await?;

    let mut report = CleanupReport {
        dry_run,
        candidates: expired.iter().map(|r| r.id()).collect(),
        deleted: 0,
    };
    if !dry_run {
        for id in &report.candidates {
            report.deleted += runtime.store.delete_tree(*id).await?;
        }
    }

    info!(
        dry_run,
        candidates = report.candidates.len(),
        deleted = report.deleted,
        %cutoff,
        "Retention cleanup"
    );
    Ok(report)
}
