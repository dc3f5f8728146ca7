//! Cron scheduler for definitions with a `schedule`.
//!
//! Each tick walks the stored definitions. A definition seen for the first
//! time gets its next fire time recorded; once that time has passed the
//! schedule is advanced first and the run launched second, so a crash
//! between the two skips a fire rather than doubling it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executor::Executor;
use crate::jobs::definition::next_cron_fire;
use crate::store::traits::DefinitionRecord;

pub struct Scheduler {
    executor: Arc<Executor>,
}

impl Scheduler {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    /// Launch every scheduled definition that is due. Returns the new
    /// manager ids.
    pub async fn check_due(&self) -> Vec<Uuid> {
        let store = &self.executor.runtime().store;
        let records = match store.list_definitions().await {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to load definitions: {}", e);
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut launched = Vec::new();
        for record in records {
            match self.check_one(&record, now).await {
                Ok(Some(id)) => launched.push(id),
                Ok(None) => {}
                Err(e) => error!(
                    definition = %record.definition.id,
                    "Scheduled run failed: {}", e
                ),
            }
        }
        launched
    }

    async fn check_one(
        &self,
        record: &DefinitionRecord,
        now: DateTime<Utc>,
    ) -> crate::error::Result<Option<Uuid>> {
        let def = &record.definition;
        let Some(schedule) = def.schedule.as_deref() else {
            return Ok(None);
        };
        if !def.enabled {
            return Ok(None);
        }
        let store = &self.executor.runtime().store;

        let next = match next_cron_fire(schedule) {
            Ok(next) => next,
            Err(e) => {
                warn!(definition = %def.id, "Skipping bad schedule: {}", e);
                return Ok(None);
            }
        };

        let Some(due_at) = record.next_fire_at else {
            store
                .set_definition_schedule(&def.id, next, record.last_fired_at)
                .await?;
            return Ok(None);
        };
        if due_at > now {
            return Ok(None);
        }

        store.set_definition_schedule(&def.id, next, Some(now)).await?;
        self.executor.validate(def)?;

        // One manager per (definition, fire time).
        let manager_id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}@{}", def.id, due_at.timestamp_millis()).as_bytes(),
        );
        let id = self
            .executor
            .launch(def, manager_id, json!({ "scheduled_for": due_at }))
            .await?;
        info!(definition = %def.id, job_id = %id, %due_at, "Scheduled run launched");
        Ok(Some(id))
    }
}

/// Spawn a background task that checks for due definitions every `interval`.
pub fn spawn_cron_ticker(
    scheduler: Arc<Scheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            scheduler.check_due().await;
        }
    })
}
