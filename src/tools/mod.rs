//! Tools the orchestrator's plans can call.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::*;
pub use builtin::HttpFetchTool;
