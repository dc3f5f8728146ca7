//! Built-in tools.

pub mod http;

pub use http::HttpFetchTool;
