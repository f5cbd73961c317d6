//! Work queue: task store, worker pool, retry and submission.
//!
//! Shutdown: [`WorkQueue::shutdown`] signals the pool to stop claiming; it does not wait
//! for in-flight tasks. Running handlers continue until they finish or time out.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use aperture_core::models::{Priority, Task, TaskPayload, TaskStatus, TaskType};
use aperture_core::{TaskError, TaskQueueSettings};

use crate::handler::TaskHandler;

/// Maximum delay before retrying a failed task. Caps exponential backoff so that high
/// retry counts do not produce excessively long delays.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// `base * 2^retry_count`, capped at [`MAX_RETRY_BACKOFF_SECS`].
#[inline]
pub(crate) fn compute_retry_backoff(retry_base_ms: u64, retry_count: i32) -> Duration {
    let cap = Duration::from_secs(MAX_RETRY_BACKOFF_SECS);
    let exponent = retry_count.clamp(0, 31) as u32;
    let millis = retry_base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(millis).min(cap)
}

#[derive(Default)]
struct QueueState {
    /// Pending, scheduled and running tasks
    live: HashMap<Uuid, Task>,
    /// Completed, failed and cancelled tasks, oldest first
    finished: VecDeque<Task>,
    /// Oldest first; bounded like `finished`
    dead_letters: Vec<Task>,
    paused: HashSet<String>,
}

impl QueueState {
    fn retire(&mut self, task: Task, retention: usize) {
        if task.status == TaskStatus::DeadLettered {
            self.dead_letters.push(task);
            let excess = self.dead_letters.len().saturating_sub(retention);
            self.dead_letters.drain(..excess);
            return;
        }
        self.finished.push_back(task);
        while self.finished.len() > retention {
            self.finished.pop_front();
        }
    }

    /// Highest priority first, then earliest schedule, then submission order.
    fn next_ready(&self, now: DateTime<Utc>) -> Option<Uuid> {
        self.live
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Scheduled))
            .filter(|t| t.scheduled_at <= now)
            .filter(|t| !self.paused.contains(&t.queue))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|t| t.id)
    }
}

struct Inner {
    config: TaskQueueSettings,
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
    wake: Notify,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

/// In-process work queue. Cloning is cheap and every clone feeds the same pool.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(config: TaskQueueSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                handlers: RwLock::new(HashMap::new()),
                wake: Notify::new(),
                shutdown_tx,
                shutdown_rx: Mutex::new(Some(shutdown_rx)),
            }),
        }
    }

    pub fn config(&self) -> &TaskQueueSettings {
        &self.inner.config
    }

    /// Register the handler for one task type, replacing any previous one.
    pub async fn register_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        tracing::debug!(task_type = %task_type, "Task handler registered");
        self.inner.handlers.write().await.insert(task_type, handler);
    }

    /// Enqueue with normal priority, ready immediately.
    pub async fn enqueue<P: TaskPayload>(&self, queue: &str, payload: &P) -> Result<Uuid> {
        self.enqueue_with_priority(queue, payload, Priority::Normal)
            .await
    }

    pub async fn enqueue_with_priority<P: TaskPayload>(
        &self,
        queue: &str,
        payload: &P,
        priority: Priority,
    ) -> Result<Uuid> {
        self.submit_task(
            queue,
            P::task_type(),
            serde_json::to_value(payload)?,
            priority,
            None,
        )
        .await
    }

    /// Enqueue to run no earlier than `at`.
    pub async fn schedule<P: TaskPayload>(
        &self,
        queue: &str,
        payload: &P,
        priority: Priority,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.submit_task(
            queue,
            P::task_type(),
            serde_json::to_value(payload)?,
            priority,
            Some(at),
        )
        .await
    }

    /// Submit a new task to the queue.
    #[tracing::instrument(skip(self, payload))]
    pub async fn submit_task(
        &self,
        queue: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid> {
        if queue.is_empty() {
            return Err(anyhow!("Queue name must not be empty"));
        }

        let now = Utc::now();
        let status = match scheduled_at {
            Some(at) if at > now => TaskStatus::Scheduled,
            _ => TaskStatus::Pending,
        };
        let task = Task {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            task_type,
            status,
            priority: priority.as_i32(),
            payload,
            result: None,
            last_error: None,
            scheduled_at: scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.inner.config.max_retries,
            timeout_seconds: Some(self.inner.config.default_timeout_seconds),
            created_at: now,
            updated_at: now,
        };
        let task_id = task.id;

        self.inner.state.lock().await.live.insert(task_id, task);
        self.inner.wake.notify_one();

        tracing::info!(
            task_id = %task_id,
            queue = %queue,
            task_type = %task_type,
            priority = priority.as_i32(),
            "Task submitted to queue"
        );

        Ok(task_id)
    }

    /// Snapshot of a task. Finished tasks are kept only up to the configured retention.
    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        let state = self.inner.state.lock().await;
        state
            .live
            .get(&task_id)
            .or_else(|| state.dead_letters.iter().find(|t| t.id == task_id))
            .or_else(|| state.finished.iter().rev().find(|t| t.id == task_id))
            .cloned()
    }

    pub async fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.get(task_id).await.map(|t| t.status)
    }

    /// Tasks in `queue` that have not started yet.
    pub async fn pending_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .live
            .values()
            .filter(|t| t.queue == queue)
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Scheduled))
            .count()
    }

    /// Stop claiming tasks from `queue`. Running tasks are unaffected.
    pub async fn pause(&self, queue: &str) {
        self.inner.state.lock().await.paused.insert(queue.to_string());
        tracing::info!(queue = %queue, "Queue paused");
    }

    pub async fn resume(&self, queue: &str) {
        self.inner.state.lock().await.paused.remove(queue);
        self.inner.wake.notify_one();
        tracing::info!(queue = %queue, "Queue resumed");
    }

    pub async fn is_paused(&self, queue: &str) -> bool {
        self.inner.state.lock().await.paused.contains(queue)
    }

    /// Cancel every pending and scheduled task in `queue`. Returns how many were cancelled.
    pub async fn clear(&self, queue: &str) -> usize {
        let retention = self.inner.config.finished_retention;
        let mut state = self.inner.state.lock().await;
        let ids: Vec<Uuid> = state
            .live
            .values()
            .filter(|t| t.queue == queue)
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Scheduled))
            .map(|t| t.id)
            .collect();

        let now = Utc::now();
        for id in &ids {
            if let Some(mut task) = state.live.remove(id) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                task.updated_at = now;
                state.retire(task, retention);
            }
        }

        tracing::info!(queue = %queue, cancelled = ids.len(), "Queue cleared");
        ids.len()
    }

    pub async fn dead_letters(&self) -> Vec<Task> {
        self.inner.state.lock().await.dead_letters.clone()
    }

    /// Move a dead-lettered task back to pending with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, task_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let position = state
            .dead_letters
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| anyhow!("Task {} is not dead-lettered", task_id))?;

        let mut task = state.dead_letters.remove(position);
        let now = Utc::now();
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.scheduled_at = now;
        task.started_at = None;
        task.completed_at = None;
        task.updated_at = now;
        state.live.insert(task.id, task);
        drop(state);

        self.inner.wake.notify_one();
        tracing::info!(task_id = %task_id, "Dead-lettered task requeued");
        Ok(())
    }

    /// Spawn the worker pool. Only the first call starts a pool.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        let shutdown_rx = self
            .inner
            .shutdown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("Work queue worker pool already started"))?;

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            Self::worker_pool(inner, shutdown_rx).await;
        }))
    }

    async fn worker_pool(inner: Arc<Inner>, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(
            max_workers = inner.config.max_workers,
            poll_interval_ms = inner.config.poll_interval_ms,
            "Work queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(inner.config.max_workers.max(1)));
        let poll_interval = Duration::from_millis(inner.config.poll_interval_ms);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Work queue worker pool shutting down");
                    break;
                }
                _ = inner.wake.notified() => {
                    Self::claim_and_dispatch(&inner, &semaphore).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch(&inner, &semaphore).await;
                }
            }
        }

        tracing::info!("Work queue worker pool stopped");
    }

    /// Claim ready tasks while workers are free.
    async fn claim_and_dispatch(inner: &Arc<Inner>, semaphore: &Arc<Semaphore>) {
        loop {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!("No workers available, skipping claim");
                    return;
                }
            };

            let Some(task) = Self::claim_next(inner).await else {
                drop(permit);
                tracing::trace!("No tasks ready in queue");
                return;
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let task_id = task.id;
                if let Err(e) = Self::process_task(&inner, task).await {
                    tracing::error!(task_id = %task_id, error = %e, "Task processing failed");
                }
                // A freed worker may unblock queued tasks
                inner.wake.notify_one();
            });
        }
    }

    async fn claim_next(inner: &Inner) -> Option<Task> {
        let mut state = inner.state.lock().await;
        let now = Utc::now();
        let id = state.next_ready(now)?;
        let task = state.live.get_mut(&id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        Some(task.clone())
    }

    #[tracing::instrument(skip(inner, task), fields(task.id = %task.id, task.type = %task.task_type, task.queue = %task.queue))]
    async fn process_task(inner: &Inner, task: Task) -> Result<()> {
        let handler = inner.handlers.read().await.get(&task.task_type).cloned();
        let Some(handler) = handler else {
            let error = format!("No handler registered for task type {}", task.task_type);
            tracing::error!(task_id = %task.id, "{}", error);
            let result = json!({ "error": error, "unrecoverable": true });
            Self::finish(inner, task.id, TaskStatus::Failed, Some(result), Some(error)).await;
            return Ok(());
        };

        let timeout_duration = task
            .timeout_seconds
            .map(|s| Duration::from_secs(s.max(1) as u64))
            .unwrap_or(Duration::from_secs(3600));

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(timeout_duration, handler.handle(&task)).await;

        match result {
            Ok(Ok(task_result)) => {
                Self::finish(inner, task.id, TaskStatus::Completed, Some(task_result), None).await;
                tracing::info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Task completed successfully"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let is_unrecoverable = TaskError::is_unrecoverable(&e);

                tracing::error!(
                    task_id = %task.id,
                    error = %e,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    unrecoverable = is_unrecoverable,
                    "Task execution failed"
                );

                if is_unrecoverable {
                    let error_result = json!({
                        "error": e.to_string(),
                        "retry_count": task.retry_count,
                        "unrecoverable": true,
                    });
                    Self::finish(
                        inner,
                        task.id,
                        TaskStatus::Failed,
                        Some(error_result),
                        Some(e.to_string()),
                    )
                    .await;
                    tracing::error!(
                        task_id = %task.id,
                        "Task failed with unrecoverable error, will not retry"
                    );
                    return Err(e);
                }

                Self::retry_or_dead_letter(inner, handler.as_ref(), &task, e.to_string()).await;
                Ok(())
            }
            Err(_) => {
                tracing::error!(
                    task_id = %task.id,
                    timeout_seconds = ?task.timeout_seconds,
                    "Task execution timed out"
                );
                Self::retry_or_dead_letter(
                    inner,
                    handler.as_ref(),
                    &task,
                    "Task execution timed out".to_string(),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn retry_or_dead_letter(
        inner: &Inner,
        handler: &dyn TaskHandler,
        task: &Task,
        error: String,
    ) {
        if task.can_retry() {
            let backoff = compute_retry_backoff(inner.config.retry_base_ms, task.retry_count);
            tracing::info!(
                task_id = %task.id,
                retry_count = task.retry_count + 1,
                backoff_ms = backoff.as_millis() as u64,
                "Scheduling task retry"
            );

            let mut state = inner.state.lock().await;
            if let Some(live) = state.live.get_mut(&task.id) {
                let now = Utc::now();
                live.retry_count += 1;
                live.status = TaskStatus::Scheduled;
                live.last_error = Some(error);
                live.started_at = None;
                live.scheduled_at = now
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(MAX_RETRY_BACKOFF_SECS as i64));
                live.updated_at = now;
            }
            return;
        }

        let error_result = json!({
            "error": error,
            "retry_count": task.retry_count,
            "reason": "Task failed after maximum retries",
        });
        Self::finish(
            inner,
            task.id,
            TaskStatus::DeadLettered,
            Some(error_result),
            Some(error.clone()),
        )
        .await;
        tracing::error!(task_id = %task.id, "Task dead-lettered after max retries");
        handler.on_dead_letter(task, &error).await;
    }

    async fn finish(
        inner: &Inner,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let mut state = inner.state.lock().await;
        let Some(mut task) = state.live.remove(&task_id) else {
            return;
        };
        let now = Utc::now();
        task.status = status;
        task.result = result;
        if error.is_some() {
            task.last_error = error;
        }
        task.completed_at = Some(now);
        task.updated_at = now;
        state.retire(task, inner.config.finished_retention);
    }

    /// Signals the worker pool to stop claiming new tasks and exit its loop.
    ///
    /// Returns immediately; already-spawned handlers keep running until they complete or
    /// time out.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating work queue shutdown");
        let _ = self.inner.shutdown_tx.send(()).await;
    }
}
