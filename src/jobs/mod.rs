//! Jobs: data model, typed configs, definitions and the service layer.

pub mod config;
pub mod definition;
pub mod model;
pub mod retention;
pub mod service;
pub mod tree;

pub use config::{CompletionMode, JobConfig};
pub use definition::{JobDefinition, OnError, StepAction, StepDefinition};
pub use model::{Job, JobRecord, JobState, JobStatus, Progress, child_id};
pub use service::JobService;
pub use tree::JobTree;
