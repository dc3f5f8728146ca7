//! Queue consumers.
//!
//! The pool leases messages and routes them by kind to a registered
//! handler. Work jobs share one adapter that owns their status lifecycle.

pub mod handler;
pub mod pool;
pub mod runner;

pub use handler::{HandlerOutcome, HandlerRegistry, MessageHandler};
pub use pool::WorkerPool;
pub use runner::{WorkContext, WorkHandler, WorkJobHandler, WorkOutput};
