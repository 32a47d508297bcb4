//! The future a caller awaits for a submitted task's result.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::PoolError;

/// Resolves once the task it was issued for finishes, fails for the last
/// time, or is orphaned by a pool-level wipe/shutdown.
pub struct TaskHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<Value, PoolError>>,
}

impl TaskHandle {
    pub(crate) fn new(id: Uuid, rx: oneshot::Receiver<Result<Value, PoolError>>) -> Self {
        Self { id, rx }
    }

    pub fn task_id(&self) -> Uuid {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender was dropped without a reply: the pool was wiped or
            // shut down out from under this task.
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}
