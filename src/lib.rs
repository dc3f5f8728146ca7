//! jobweave: durable job trees over a libSQL-backed queue.
//!
//! Definitions become a manager job with one step job per step. Steps run
//! inline, fan out work jobs that the completion probe watches, or hand
//! over to the LLM orchestrator. Every hop goes through the durable queue,
//! so a restarted process picks up where the last one stopped.

pub mod config;
pub mod documents;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod jobs;
pub mod llm;
pub mod orchestrator;
pub mod probe;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod worker;
