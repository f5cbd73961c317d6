//! Task handler trait
//!
//! One handler is registered per [`TaskType`](aperture_core::models::TaskType). The
//! queue calls it for every claimed task of that type.

use anyhow::Result;
use async_trait::async_trait;

use aperture_core::models::Task;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task and return a JSON result stored on the completed task.
    ///
    /// Errors are retried by the queue unless wrapped in an unrecoverable
    /// [`TaskError`](aperture_core::TaskError). `task.retry_count` and
    /// [`Task::is_final_attempt`] tell the handler whether another attempt will follow.
    async fn handle(&self, task: &Task) -> Result<serde_json::Value>;

    /// Called once when the task is dead-lettered, after its last attempt failed or
    /// timed out. The timed-out attempt has been dropped by then, so this is where a
    /// handler releases whatever that attempt left half-done.
    async fn on_dead_letter(&self, _task: &Task, _error: &str) {}
}
