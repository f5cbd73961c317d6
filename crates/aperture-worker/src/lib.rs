//! Aperture work queue
//!
//! Named queues of prioritised, optionally delayed tasks, executed by a bounded worker
//! pool that owns retries, timeouts and dead-lettering.

pub mod handler;
pub mod queue;

pub use handler::TaskHandler;
pub use queue::{WorkQueue, MAX_RETRY_BACKOFF_SECS};
