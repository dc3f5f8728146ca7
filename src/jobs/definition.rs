//! Job definitions: named, ordered lists of steps plus post-jobs.
//!
//! Definitions are plain data. They are stored as JSON, loaded from JSON or
//! TOML files in a directory at startup, and snapshotted into the manager job's config when
//! executed so later edits never affect a run in flight.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub steps: Vec<StepDefinition>,
    /// Definition ids started after this one succeeds.
    #[serde(default)]
    pub post_jobs: Vec<String>,
    /// Bound on the whole run.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Cron expression (seconds field first).
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// One step of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// What a step does. Tagged by `action` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Fetch pages starting from `seeds`, following links up to `max_depth`.
    Crawl {
        seeds: Vec<String>,
        #[serde(default = "default_max_depth")]
        max_depth: u32,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
        /// Regexes a discovered URL must match (any).
        #[serde(default)]
        include: Vec<String>,
        /// Regexes that reject a discovered URL.
        #[serde(default)]
        exclude: Vec<String>,
        #[serde(default = "default_true")]
        same_host: bool,
    },
    /// Rebuild the full-text index.
    Reindex,
    /// Publish a notification.
    Notify {
        message: String,
        #[serde(default)]
        channel: Option<String>,
    },
    /// Plan tool calls with the LLM, run them as jobs, review the outcome.
    Orchestrate {
        goal: String,
        tools: Vec<String>,
        #[serde(default)]
        max_rounds: Option<u32>,
    },
    /// Delete terminal root jobs older than the cutoff.
    Cleanup {
        #[serde(default)]
        max_age_hours: Option<u64>,
        #[serde(default)]
        dry_run: bool,
    },
}

fn default_max_depth() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    100
}

/// Registry key of a step action: `(type, action)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub job_type: &'static str,
    pub action: &'static str,
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.job_type, self.action)
    }
}

impl StepAction {
    pub fn key(&self) -> ActionKey {
        let (job_type, action) = match self {
            Self::Crawl { .. } => ("crawler", "crawl"),
            Self::Reindex => ("index", "reindex"),
            Self::Notify { .. } => ("notify", "send"),
            Self::Orchestrate { .. } => ("orchestrator", "orchestrate"),
            Self::Cleanup { .. } => ("maintenance", "cleanup"),
        };
        ActionKey { job_type, action }
    }
}

/// What happens when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Fail the whole run.
    #[default]
    Fail,
    /// Record the failure and move on to the next step.
    Continue,
    /// Re-attempt the step with exponential backoff.
    Retry {
        max_attempts: u32,
        #[serde(default = "default_backoff_ms")]
        backoff_ms: u64,
    },
}

fn default_backoff_ms() -> u64 {
    1000
}

impl OnError {
    /// Delay before attempt `attempt + 1`, or `None` once attempts are used up.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Retry {
                max_attempts,
                backoff_ms,
            } if attempt < max_attempts => {
                let factor = 1u64 << attempt.saturating_sub(1).min(16);
                Some(Duration::from_millis(backoff_ms.saturating_mul(factor)))
            }
            _ => None,
        }
    }
}

impl JobDefinition {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Structural validation. Action keys are checked against the registry
    /// separately.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let invalid = |reason: String| DefinitionError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("definition has no steps".into()));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(invalid("step name is empty".into()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }
            if let OnError::Retry { max_attempts: 0, .. } = step.on_error {
                return Err(invalid(format!("step '{}': max_attempts must be >= 1", step.name)));
            }
            match &step.action {
                StepAction::Crawl {
                    seeds,
                    include,
                    exclude,
                    ..
                } => {
                    if seeds.is_empty() {
                        return Err(invalid(format!("step '{}': crawl has no seeds", step.name)));
                    }
                    for pattern in include.iter().chain(exclude) {
                        regex::Regex::new(pattern).map_err(|e| {
                            invalid(format!("step '{}': bad pattern {pattern}: {e}", step.name))
                        })?;
                    }
                }
                StepAction::Orchestrate { goal, tools, .. } => {
                    if goal.trim().is_empty() {
                        return Err(invalid(format!("step '{}': goal is empty", step.name)));
                    }
                    if tools.is_empty() {
                        return Err(invalid(format!("step '{}': no tools allowed", step.name)));
                    }
                }
                StepAction::Reindex | StepAction::Notify { .. } | StepAction::Cleanup { .. } => {}
            }
        }

        if self.post_jobs.iter().any(|p| p == &self.id) {
            return Err(invalid("definition lists itself as a post-job".into()));
        }

        if let Some(schedule) = &self.schedule {
            next_cron_fire(schedule).map_err(invalid)?;
        }

        Ok(())
    }
}

/// Calculate the next fire time for a cron schedule.
pub fn next_cron_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.upcoming(Utc).next())
}

/// Definition file formats `load_dir` understands, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    fn of(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(Self::Json),
            Some("toml") => Some(Self::Toml),
            _ => None,
        }
    }

    fn parse(self, raw: &str) -> Result<JobDefinition, String> {
        match self {
            Self::Json => serde_json::from_str(raw).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str(raw).map_err(|e| e.to_string()),
        }
    }
}

/// Load every `*.json` and `*.toml` definition in a directory.
pub async fn load_dir(dir: &Path) -> Result<Vec<JobDefinition>, DefinitionError> {
    let load_err = |path: &Path, reason: String| DefinitionError::Load {
        path: path.display().to_string(),
        reason,
    };

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| load_err(dir, e.to_string()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| load_err(dir, e.to_string()))?
    {
        let path = entry.path();
        if let Some(format) = FileFormat::of(&path) {
            paths.push((path, format));
        }
    }
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for (path, format) in paths {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| load_err(&path, e.to_string()))?;
        let def = format.parse(&raw).map_err(|e| load_err(&path, e))?;
        def.validate()?;
        definitions.push(def);
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crawl_def() -> JobDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "docs",
            "name": "Crawl docs",
            "steps": [
                {"name": "crawl", "action": "crawl", "seeds": ["https://example.com/"], "on_error": "continue"},
                {"name": "reindex", "action": "reindex", "on_error": {"retry": {"max_attempts": 3}}}
            ],
            "post_jobs": ["notify"]
        }))
        .unwrap()
    }

    #[test]
    fn parses_tagged_steps() {
        let def = crawl_def();
        assert!(def.enabled);
        assert_eq!(def.steps.len(), 2);
        match &def.steps[0].action {
            StepAction::Crawl {
                max_depth,
                same_host,
                ..
            } => {
                assert_eq!(*max_depth, 1);
                assert!(*same_host);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(def.steps[0].on_error, OnError::Continue);
        assert_eq!(def.steps[1].action.key().to_string(), "(index, reindex)");
        def.validate().unwrap();
    }

    #[test]
    fn unknown_action_is_rejected_at_parse() {
        let result: Result<JobDefinition, _> = serde_json::from_value(serde_json::json!({
            "id": "x", "name": "x",
            "steps": [{"name": "s", "action": "teleport"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn validation_catches_duplicates_and_bad_cron() {
        let mut def = crawl_def();
        def.steps[1].name = "crawl".into();
        assert!(def.validate().is_err());

        let mut def = crawl_def();
        def.schedule = Some("not a cron".into());
        assert!(def.validate().is_err());

        let mut def = crawl_def();
        def.schedule = Some("0 0 * * * *".into());
        def.validate().unwrap();
    }

    #[test]
    fn retry_delay_backs_off_then_stops() {
        let policy = OnError::Retry {
            max_attempts: 3,
            backoff_ms: 100,
        };
        assert_eq!(policy.retry_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.retry_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.retry_delay(3), None);
        assert_eq!(OnError::Continue.retry_delay(1), None);
    }

    #[tokio::test]
    async fn load_dir_reads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docs.json"),
            serde_json::to_string(&crawl_def()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let defs = load_dir(dir.path()).await.unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "docs");
    }

    #[tokio::test]
    async fn load_dir_reads_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nightly.toml"),
            r#"
id = "nightly"
name = "Nightly refresh"
schedule = "0 0 3 * * *"
post_jobs = ["docs"]

[[steps]]
name = "crawl"
action = "crawl"
seeds = ["https://example.com/"]
max_depth = 2
on_error = "continue"

[[steps]]
name = "reindex"
action = "reindex"
timeout_secs = 30
on_error = { retry = { max_attempts = 3 } }
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("docs.json"),
            serde_json::to_string(&crawl_def()).unwrap(),
        )
        .unwrap();

        let defs = load_dir(dir.path()).await.unwrap();
        assert_eq!(defs.len(), 2);
        let nightly = defs.iter().find(|d| d.id == "nightly").unwrap();
        assert_eq!(nightly.steps.len(), 2);
        assert!(matches!(
            nightly.steps[0].action,
            StepAction::Crawl { max_depth: 2, .. }
        ));
        assert_eq!(nightly.steps[0].on_error, OnError::Continue);
        assert_eq!(
            nightly.steps[1].on_error,
            OnError::Retry {
                max_attempts: 3,
                backoff_ms: 1000
            }
        );
        assert_eq!(nightly.steps[1].timeout(), Some(Duration::from_secs(30)));
        assert_eq!(nightly.post_jobs, vec!["docs"]);
    }

    #[tokio::test]
    async fn load_dir_names_the_broken_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "id = ").unwrap();

        let err = load_dir(dir.path()).await.unwrap_err();
        assert!(
            matches!(&err, DefinitionError::Load { path, .. } if path.ends_with("broken.toml")),
            "{err}"
        );
    }
}
