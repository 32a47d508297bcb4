//! The worker-context contract.
//!
//! The pool treats the thing that actually runs a task's code as an external
//! collaborator reachable only through [`ExecutionBody`]. This module also
//! ships the one concrete implementation the crate needs to be usable and
//! testable on its own: [`ClosureBody`], which wraps an embedder-supplied
//! async closure. A real embedder is free to implement [`ExecutionBody`]
//! against a process pool, a WASM sandbox, or anything else that can
//! evaluate one payload and return one result.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Whether a body conceptually came from a file path (`Exec`) or from
/// inline source (`Eval`). Rust has no runtime `eval`, so both are just
/// [`ExecutionBody`] trait objects here; `PoolKind` survives purely as
/// metadata forwarded into every [`ExecutionBody::call`] for a body to
/// branch on if it cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Eval,
    Exec,
}

/// A side channel a body can use to report a non-terminal diagnostic, one
/// not tied to any one task's response and that does not kill the worker.
#[derive(Clone)]
pub struct Diagnostics {
    pub(crate) thread_id: Uuid,
    pub(crate) tx: mpsc::UnboundedSender<crate::worker::WorkerEvent>,
}

impl Diagnostics {
    /// Surface a non-fatal error to the pool's `worker:error` observers.
    /// Does not fail the in-flight task and does not affect worker state.
    pub fn report(&self, detail: impl std::fmt::Display) {
        let _ = self.tx.send(crate::worker::WorkerEvent::Error {
            thread_id: self.thread_id,
            detail: detail.to_string(),
        });
    }
}

/// The execution body a [`crate::worker::WorkerHandle`] runs a task's
/// payload through: a single callable of one argument (the payload) whose
/// returned value or propagated error becomes the task's response.
///
/// A panic inside `call` is caught at the worker's supervising task and
/// reported as the context dying (`exit`), not as a task failure — see
/// `crate::worker`.
#[async_trait]
pub trait ExecutionBody: Send + Sync {
    async fn call(&self, payload: Value, kind: PoolKind, diagnostics: &Diagnostics) -> anyhow::Result<Value>;
}

/// Wraps an async closure as an [`ExecutionBody`].
pub struct ClosureBody<F> {
    f: F,
}

impl<F> ClosureBody<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ExecutionBody for ClosureBody<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, payload: Value, _kind: PoolKind, _diagnostics: &Diagnostics) -> anyhow::Result<Value> {
        (self.f)(payload).await
    }
}

/// Convenience constructor: `body::closure(|payload| async move { ... })`.
pub fn closure<F, Fut>(f: F) -> Arc<dyn ExecutionBody>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(ClosureBody::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_diagnostics() -> Diagnostics {
        let (tx, _rx) = mpsc::unbounded_channel();
        Diagnostics {
            thread_id: Uuid::new_v4(),
            tx,
        }
    }

    #[tokio::test]
    async fn closure_body_returns_its_result() {
        let body = closure(|payload| async move { Ok(payload) });
        let diag = test_diagnostics();
        let out = body.call(Value::from(42), PoolKind::Exec, &diag).await.unwrap();
        assert_eq!(out, Value::from(42));
    }

    #[tokio::test]
    async fn closure_body_propagates_errors() {
        let body = closure(|_payload| async move { Err(anyhow::anyhow!("boom")) });
        let diag = test_diagnostics();
        let err = body.call(Value::Null, PoolKind::Exec, &diag).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn diagnostics_report_does_not_panic_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let diag = Diagnostics {
            thread_id: Uuid::new_v4(),
            tx,
        };
        diag.report("ignored");
    }
}
