//! Error types for jobweave.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue storage failed: {0}")]
    Storage(String),

    #[error("Lease for message {id} is no longer held")]
    LeaseLost { id: String },

    #[error("Undecodable message {id}: {reason}")]
    Decode { id: String, reason: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Cannot delete job {id} while it is {status}. Cancel it first.")]
    Active { id: Uuid, status: String },

    #[error("Job {id} is {state}; {action} requires {required}")]
    InvalidState {
        id: Uuid,
        state: String,
        action: String,
        required: String,
    },

    #[error("Job {id} is not a manager job; {action} only applies to root jobs")]
    NotManager { id: Uuid, action: String },

    #[error("Invalid job config: {0}")]
    InvalidConfig(String),

    #[error("Job {id} timed out after {timeout:?}")]
    Timeout { id: Uuid, timeout: Duration },
}

/// Job definition errors.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Definition {id} not found")]
    NotFound { id: String },

    #[error("Definition {id} is disabled")]
    Disabled { id: String },

    #[error("Invalid definition {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("No action registered for ({job_type}, {action})")]
    UnknownAction { job_type: String, action: String },

    #[error("Failed to load definition from {path}: {reason}")]
    Load { path: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a later attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::RequestFailed { .. } => true,
            Self::InvalidResponse { .. } | Self::AuthFailed { .. } | Self::Json(_) => false,
        }
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {0} not found")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl ToolError {
    /// Whether a later attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Planner/reviewer output errors.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("no actionable plan: {0}")]
    NoActionablePlan(String),

    #[error("plan references unknown tool {tool}")]
    UnknownTool { tool: String },

    #[error("plan call {call} depends on unknown call {dependency}")]
    UnknownDependency { call: String, dependency: String },

    #[error("plan contains a dependency cycle through {call}")]
    Cycle { call: String },

    #[error("malformed {phase} output: {reason}")]
    Malformed { phase: String, reason: String },
}

/// Failure of a queue message handler.
///
/// Retryable failures leave the message to be redelivered after a backoff;
/// terminal ones fail the job and drop the message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("{0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        match &e {
            Error::Database(_) | Error::Queue(_) => Self::Retryable(e.to_string()),
            Error::Llm(llm) if llm.is_transient() => Self::Retryable(e.to_string()),
            Error::Tool(tool) if tool.is_transient() => Self::Retryable(e.to_string()),
            _ => Self::Terminal(e.to_string()),
        }
    }
}

impl From<DatabaseError> for HandlerError {
    fn from(e: DatabaseError) -> Self {
        Error::from(e).into()
    }
}

impl From<QueueError> for HandlerError {
    fn from(e: QueueError) -> Self {
        Error::from(e).into()
    }
}

impl From<JobError> for HandlerError {
    fn from(e: JobError) -> Self {
        Error::from(e).into()
    }
}

impl From<LlmError> for HandlerError {
    fn from(e: LlmError) -> Self {
        Error::from(e).into()
    }
}

impl From<ToolError> for HandlerError {
    fn from(e: ToolError) -> Self {
        Error::from(e).into()
    }
}

impl From<PlanError> for HandlerError {
    fn from(e: PlanError) -> Self {
        Error::from(e).into()
    }
}

impl From<DefinitionError> for HandlerError {
    fn from(e: DefinitionError) -> Self {
        Error::from(e).into()
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
