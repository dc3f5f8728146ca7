//! Configuration types.
//!
//! Every knob has a default; `from_env()` overrides them from `JOBWEAVE_*`
//! variables. Unparseable values fall back to the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Durable queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a received message stays invisible to other workers.
    pub lease: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receive: u32,
    /// Base delay for retryable handler failures.
    pub retry_base: Duration,
    /// Upper bound for the retry delay.
    pub retry_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300), // 5 minutes
            max_receive: 5,
            retry_base: Duration::from_secs(2),
            retry_max: Duration::from_secs(120),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Sleep between receives when the queue is empty.
    pub poll_interval: Duration,
    /// How long `stop()` waits for in-flight handlers.
    pub shutdown_timeout: Duration,
    /// Default per-job execution timeout.
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
        }
    }
}

/// Completion probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Delay before the first check after a subtree goes idle.
    pub initial_delay: Duration,
    /// Minimum quiet time since the last child heartbeat before completing.
    pub staleness: Duration,
    /// Force-complete a step that has been probed for longer than this.
    pub max_age: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            staleness: Duration::from_secs(5),
            max_age: Duration::from_secs(1800), // 30 minutes
        }
    }
}

/// Planner/reviewer settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often a waiting orchestrator re-checks its tool jobs.
    pub poll_interval: Duration,
    /// Maximum time to wait for tool jobs in one round.
    pub max_wait: Duration,
    /// Default number of plan/review rounds.
    pub max_rounds: u32,
    /// Token budget for planner and reviewer calls.
    pub max_tokens: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(600), // 10 minutes
            max_rounds: 2,
            max_tokens: 2048,
        }
    }
}

/// Retention cleanup settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Terminal root jobs older than this are eligible for deletion.
    pub max_age: Duration,
    /// Report instead of deleting.
    pub dry_run: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 3600),
            dry_run: false,
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite/libSQL database file.
    pub db_path: PathBuf,
    /// Directory of `*.json` job definitions loaded at startup.
    pub definitions_dir: Option<PathBuf>,
    /// How often scheduled definitions are checked.
    pub cron_interval: Duration,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub probe: ProbeConfig,
    pub orchestrator: OrchestratorConfig,
    pub retention: RetentionConfig,
    pub llm: LlmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jobweave.db"),
            definitions_dir: None,
            cron_interval: Duration::from_secs(60),
            log_dir: None,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            probe: ProbeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            retention: RetentionConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();

        let queue = QueueConfig {
            lease: Duration::from_secs(env_or("JOBWEAVE_LEASE_SECS", d.queue.lease.as_secs())),
            max_receive: env_or("JOBWEAVE_MAX_RECEIVE", d.queue.max_receive).max(1),
            ..d.queue
        };

        let worker = WorkerConfig {
            concurrency: env_or("JOBWEAVE_CONCURRENCY", d.worker.concurrency).max(1),
            poll_interval: Duration::from_millis(env_or(
                "JOBWEAVE_POLL_INTERVAL_MS",
                d.worker.poll_interval.as_millis() as u64,
            )),
            shutdown_timeout: Duration::from_secs(env_or(
                "JOBWEAVE_SHUTDOWN_TIMEOUT_SECS",
                d.worker.shutdown_timeout.as_secs(),
            )),
            job_timeout: Duration::from_secs(env_or(
                "JOBWEAVE_JOB_TIMEOUT_SECS",
                d.worker.job_timeout.as_secs(),
            )),
        };

        let probe = ProbeConfig {
            initial_delay: Duration::from_millis(env_or(
                "JOBWEAVE_PROBE_DELAY_MS",
                d.probe.initial_delay.as_millis() as u64,
            )),
            staleness: Duration::from_millis(env_or(
                "JOBWEAVE_STALENESS_MS",
                d.probe.staleness.as_millis() as u64,
            )),
            max_age: Duration::from_secs(env_or(
                "JOBWEAVE_PROBE_MAX_AGE_SECS",
                d.probe.max_age.as_secs(),
            )),
        };

        let orchestrator = OrchestratorConfig {
            poll_interval: Duration::from_millis(env_or(
                "JOBWEAVE_ORCH_POLL_MS",
                d.orchestrator.poll_interval.as_millis() as u64,
            )),
            max_wait: Duration::from_secs(env_or(
                "JOBWEAVE_ORCH_MAX_WAIT_SECS",
                d.orchestrator.max_wait.as_secs(),
            )),
            max_rounds: env_or("JOBWEAVE_ORCH_MAX_ROUNDS", d.orchestrator.max_rounds).max(1),
            ..d.orchestrator
        };

        let retention = RetentionConfig {
            max_age: Duration::from_secs(
                env_or("JOBWEAVE_RETENTION_HOURS", d.retention.max_age.as_secs() / 3600) * 3600,
            ),
            dry_run: env_or("JOBWEAVE_RETENTION_DRY_RUN", d.retention.dry_run),
        };

        let llm = LlmConfig {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            model: std::env::var("JOBWEAVE_MODEL").unwrap_or(d.llm.model),
        };

        Self {
            db_path: std::env::var("JOBWEAVE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            definitions_dir: std::env::var("JOBWEAVE_DEFINITIONS_DIR")
                .ok()
                .map(PathBuf::from),
            cron_interval: Duration::from_secs(env_or(
                "JOBWEAVE_CRON_INTERVAL_SECS",
                d.cron_interval.as_secs(),
            )),
            log_dir: std::env::var("JOBWEAVE_LOG_DIR").ok().map(PathBuf::from),
            queue,
            worker,
            probe,
            orchestrator,
            retention,
            llm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.worker.concurrency >= 1);
        assert!(config.queue.max_receive >= 1);
        assert!(config.probe.staleness > Duration::ZERO);
        assert_eq!(config.orchestrator.poll_interval, Duration::from_secs(3));
        assert_eq!(config.orchestrator.max_wait, Duration::from_secs(600));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // Unique key so parallel tests don't collide.
        let key = "JOBWEAVE_TEST_ENV_OR_GARBAGE";
        assert_eq!(env_or(key, 7u32), 7);
    }
}
