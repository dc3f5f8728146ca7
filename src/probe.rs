//! Completion probe for fan-out steps.
//!
//! A fan-out step has no fixed number of children: a crawl discovers pages
//! while it runs. The probe decides when such a subtree is done. It is a
//! self-requeuing message (one per step, id `probe:{step}`) whose payload
//! carries the idle observation, so no completion state lives in memory.
//!
//! A step completes only after two idle observations separated by the
//! staleness gap with no child activity in between. A child created or
//! finished in that window bumps the step heartbeat and resets the
//! observation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::error::HandlerError;
use crate::events::JobEvent;
use crate::jobs::config::CompletionMode;
use crate::jobs::model::JobStatus;
use crate::queue::{Lease, kinds};
use crate::runtime::Runtime;
use crate::store::traits::LogLevel;
use crate::worker::handler::{HandlerOutcome, MessageHandler};

/// Idle observation carried in the probe payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeState {
    /// When the subtree was first seen idle (ms).
    #[serde(default)]
    pub idle_since: Option<i64>,
    /// The step heartbeat at that observation (ms).
    #[serde(default)]
    pub heartbeat: Option<i64>,
}

/// Inputs of one probe check.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInput {
    pub status: JobStatus,
    /// Live pending + running descendants from a recount.
    pub active: i64,
    /// Last child activity on the step (ms).
    pub heartbeat: i64,
    pub started_at: i64,
    pub step_timeout: Option<Duration>,
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeDecision {
    /// Step already terminal.
    Done,
    /// Ran longer than its step timeout.
    TimedOut,
    /// Check again after `delay` with the given observation.
    Reschedule { state: ProbeState, delay: Duration },
    Complete { possibly_incomplete: bool },
}

fn ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// Decide what to do with a fan-out step.
pub fn decide(input: &ProbeInput, state: &ProbeState, config: &ProbeConfig) -> ProbeDecision {
    if input.status.is_terminal() {
        return ProbeDecision::Done;
    }

    let age = input.now - input.started_at;
    if let Some(timeout) = input.step_timeout
        && age > ms(timeout)
    {
        return ProbeDecision::TimedOut;
    }

    let max_age = ms(config.max_age);
    if input.active > 0 {
        // Children whose messages were lost never re-arm the probe.
        if age > max_age {
            return ProbeDecision::Complete {
                possibly_incomplete: true,
            };
        }
        // The last child to finish re-arms the probe sooner. Otherwise come
        // back at the nearest deadline so a stuck subtree still ends.
        let deadline = input
            .step_timeout
            .map_or(max_age, |timeout| ms(timeout).min(max_age));
        return ProbeDecision::Reschedule {
            state: ProbeState::default(),
            delay: Duration::from_millis((deadline - age).max(1) as u64),
        };
    }

    let staleness = ms(config.staleness);
    let quiet_for = input.now - input.heartbeat;

    if let (Some(_), Some(observed)) = (state.idle_since, state.heartbeat)
        && observed == input.heartbeat
    {
        if quiet_for >= staleness {
            return ProbeDecision::Complete {
                possibly_incomplete: false,
            };
        }
        return ProbeDecision::Reschedule {
            state: *state,
            delay: Duration::from_millis((staleness - quiet_for).max(1) as u64),
        };
    }

    if age > max_age {
        return ProbeDecision::Complete {
            possibly_incomplete: true,
        };
    }

    // First idle observation, or activity since the last one.
    ProbeDecision::Reschedule {
        state: ProbeState {
            idle_since: Some(input.now),
            heartbeat: Some(input.heartbeat),
        },
        delay: config.staleness,
    }
}

/// Handles `probe` messages.
pub struct ProbeHandler {
    runtime: Runtime,
}

impl ProbeHandler {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    async fn complete(&self, lease: &Lease, possibly_incomplete: bool) -> Result<(), HandlerError> {
        let step_id = lease.message.job_id;
        let record = self.runtime.load(step_id).await?;
        let progress = self.runtime.store.reconcile_progress(step_id).await?;
        if possibly_incomplete {
            self.runtime
                .store
                .merge_metadata(step_id, &serde_json::json!({ "possibly_incomplete": true }))
                .await?;
        }

        if !self
            .runtime
            .transition(&record.job, JobStatus::Running, JobStatus::Completed, None)
            .await?
        {
            return Ok(());
        }

        let stranded = if possibly_incomplete {
            self.runtime
                .cancel_descendants(step_id, "step force-completed at max age")
                .await?
        } else {
            0
        };

        info!(
            job_id = %step_id,
            total = progress.total,
            failed = progress.failed,
            stranded,
            possibly_incomplete,
            "Fan-out step completed"
        );
        self.runtime
            .log(
                step_id,
                if possibly_incomplete { LogLevel::Warn } else { LogLevel::Info },
                &format!(
                    "Completed: {} children, {} failed{}",
                    progress.total,
                    progress.failed,
                    if possibly_incomplete { " (forced, possibly incomplete)" } else { "" }
                ),
            )
            .await;
        self.runtime.events.publish(JobEvent::Completed {
            job_id: step_id,
            status: JobStatus::Completed,
            possibly_incomplete,
        });
        self.runtime.after_terminal(&record.job).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ProbeHandler {
    fn kind(&self) -> &str {
        kinds::PROBE
    }

    async fn handle(&self, lease: &Lease) -> Result<HandlerOutcome, HandlerError> {
        let step_id = lease.message.job_id;
        let Some(record) = self.runtime.store.get_job(step_id).await? else {
            return Ok(HandlerOutcome::Done);
        };
        let Some((_, step, CompletionMode::Probe)) = record.job.config.as_step() else {
            warn!(job_id = %step_id, "Probe for a job that is not a fan-out step");
            return Ok(HandlerOutcome::Done);
        };

        let state: ProbeState =
            serde_json::from_value(lease.message.payload.clone()).unwrap_or_default();
        let summary = self.runtime.store.child_summary(step_id).await?;
        let now = Utc::now().timestamp_millis();
        let started_at = record
            .state
            .started_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(now);
        let input = ProbeInput {
            status: record.status(),
            active: summary.active(),
            heartbeat: record
                .state
                .last_heartbeat
                .map(|t: DateTime<Utc>| t.timestamp_millis())
                .unwrap_or(started_at),
            started_at,
            step_timeout: step.timeout(),
            now,
        };

        let decision = decide(&input, &state, &self.runtime.config.probe);
        debug!(job_id = %step_id, active = input.active, ?decision, "Probe check");

        match decision {
            ProbeDecision::Done => Ok(HandlerOutcome::Done),
            ProbeDecision::Reschedule { state, delay } => Ok(HandlerOutcome::after_with(
                delay,
                serde_json::to_value(state)
                    .map_err(|e| HandlerError::Terminal(format!("probe state: {e}")))?,
            )),
            ProbeDecision::Complete {
                possibly_incomplete,
            } => {
                self.complete(lease, possibly_incomplete).await?;
                Ok(HandlerOutcome::Done)
            }
            ProbeDecision::TimedOut => {
                warn!(job_id = %step_id, "Fan-out step timed out");
                self.runtime
                    .fail(step_id, "step timed out", Some("timeout"))
                    .await?;
                let cancelled = self
                    .runtime
                    .cancel_descendants(step_id, "parent step timed out")
                    .await?;
                debug!(job_id = %step_id, cancelled, "Cancelled children of timed-out step");
                Ok(HandlerOutcome::Done)
            }
        }
    }
}
