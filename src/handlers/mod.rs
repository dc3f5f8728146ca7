//! Work job handlers.

pub mod crawl;
pub mod tool_call;

pub use crawl::{CrawlPageHandler, FetchError, FetchedPage, HttpPageFetcher, PageFetcher};
pub use tool_call::ToolCallHandler;
