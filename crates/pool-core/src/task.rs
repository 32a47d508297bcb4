//! A single submission to the pool, plus its retry accounting.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::body::ExecutionBody;

/// Upper bound on a task's retry budget, clamped at construction.
pub const MAX_TASK_RETRY: u32 = 5;

/// Whether a task runs the pool's default body or one it carries itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    PoolDefault,
    Dynamic,
}

/// Per-task overrides accepted by [`crate::pool::Pool::send`].
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Retry budget for this task only; falls back to the pool's
    /// `task_retry` default when `None`.
    pub task_retry: Option<u32>,
    /// A body that overrides the pool's default for this task only. Its
    /// presence is what makes `exec_kind()` report [`ExecKind::Dynamic`].
    pub exec_override: Option<Arc<dyn ExecutionBody>>,
}

/// One unit of work plus its retry counter and identity.
///
/// Fields are set once at construction except `retries_left`, which only
/// the pool mutates (via [`Task::decrement_retry`]) as part of
/// [`crate::queue::TaskQueue::retry_task`].
#[derive(Clone)]
pub struct Task {
    pub id: Uuid,
    pub payload: Value,
    pub exec_override: Option<Arc<dyn ExecutionBody>>,
    retries_left: u32,
}

impl Task {
    pub fn new(payload: Value, options: TaskOptions, pool_default_retry: u32) -> Self {
        let requested = options.task_retry.unwrap_or(pool_default_retry);
        Self {
            id: Uuid::new_v4(),
            payload,
            exec_override: options.exec_override,
            retries_left: requested.min(MAX_TASK_RETRY),
        }
    }

    pub fn exec_kind(&self) -> ExecKind {
        if self.exec_override.is_some() {
            ExecKind::Dynamic
        } else {
            ExecKind::PoolDefault
        }
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn is_retryable(&self) -> bool {
        self.retries_left > 0
    }

    /// Decrements the retry counter. Only ever called after
    /// [`Task::is_retryable`] has been checked by the queue; decrementing a
    /// task with no retries left is an internal invariant violation.
    pub(crate) fn decrement_retry(&mut self) {
        assert!(
            self.retries_left > 0,
            "decrement_retry called on a task with no retries left"
        );
        self.retries_left -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_left_clamped_to_max_task_retry() {
        let task = Task::new(Value::Null, TaskOptions::default(), 99);
        assert_eq!(task.retries_left(), MAX_TASK_RETRY);
    }

    #[test]
    fn per_task_override_beats_pool_default() {
        let opts = TaskOptions {
            task_retry: Some(2),
            exec_override: None,
        };
        let task = Task::new(Value::Null, opts, 0);
        assert_eq!(task.retries_left(), 2);
    }

    #[test]
    fn exec_kind_reflects_override_presence() {
        let task = Task::new(Value::Null, TaskOptions::default(), 0);
        assert_eq!(task.exec_kind(), ExecKind::PoolDefault);

        let opts = TaskOptions {
            task_retry: None,
            exec_override: Some(crate::body::closure(|p| async move { Ok(p) })),
        };
        let dynamic = Task::new(Value::Null, opts, 0);
        assert_eq!(dynamic.exec_kind(), ExecKind::Dynamic);
    }

    #[test]
    fn is_retryable_reflects_remaining_budget() {
        let mut task = Task::new(Value::Null, TaskOptions::default(), 1);
        assert!(task.is_retryable());
        task.decrement_retry();
        assert!(!task.is_retryable());
    }

    #[test]
    #[should_panic(expected = "no retries left")]
    fn decrement_retry_panics_when_exhausted() {
        let mut task = Task::new(Value::Null, TaskOptions::default(), 0);
        task.decrement_retry();
    }
}
