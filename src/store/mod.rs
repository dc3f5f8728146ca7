//! Persistence layer: the `JobStore` trait and its libSQL backend.

pub(crate) mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    DefinitionRecord, GroupedJob, JobFilter, JobLogEntry, JobPage, JobStore, LogLevel,
    ParentFilter,
};
