//! Error types for the pool's public surface.
//!
//! Mirrors the error kinds in the design: argument validation fails
//! synchronously, `send` can fail synchronously with [`PoolError::QueueFull`],
//! and everything else reaches the caller through the per-task future.

use uuid::Uuid;

/// Errors the pool surfaces to callers, either synchronously from `send`/the
/// setters, or asynchronously by rejecting a task's completion handle.
#[derive(Debug, thiserror::Error, Clone)]
pub enum PoolError {
    /// A constructor or setter argument failed validation (see
    /// [`crate::pool::validate_options`]).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `send` was called while the pool was at capacity, no worker was idle,
    /// and the queue was full.
    #[error("queue is full")]
    QueueFull,

    /// The task ran out of retries and its last attempt still failed at the
    /// application level.
    #[error("task failed: {0}")]
    TaskFailed(serde_json::Value),

    /// The worker's execution context died while running this task. A dead
    /// context is not retried: there is no way to know whether the task
    /// itself caused the crash.
    #[error("worker {thread_id} exited while running the task: {detail}")]
    WorkerExited { thread_id: Uuid, detail: String },

    /// The task was in the queue when [`crate::pool::Pool::wipe_task_queue`]
    /// was called.
    #[error("task queue was wiped")]
    Wiped,

    /// The pool was shut down before this task's completion handle resolved.
    #[error("pool was shut down")]
    Shutdown,
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;
