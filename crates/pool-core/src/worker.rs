//! A worker: owns one execution context, runs at most one task at a time,
//! and emits lifecycle events.
//!
//! The execution context is realized as a single supervised `tokio` task —
//! a workable stand-in for an isolated OS-thread-backed context given the
//! dispatcher's own concurrency model is already a single actor talking to
//! its workers over async message passing. The body's call is wrapped in
//! `catch_unwind` so a panicking body surfaces as a caught panic rather
//! than unwinding the supervising task, and is mapped onto the worker's
//! `exit` event; because the body runs directly on this task (no nested
//! spawn), aborting the task's `JoinHandle` on drop actually cancels an
//! in-flight body at its next await point.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::body::{Diagnostics, ExecutionBody, PoolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Exited,
}

/// Events a worker's execution context can emit.
#[derive(Debug, Clone)]
pub(crate) enum WorkerEvent {
    /// `code = SUCCESS` is `Ok`; any other code is `Err` carrying whatever
    /// detail the body attached.
    Response {
        thread_id: Uuid,
        task_id: Uuid,
        result: Result<Value, Value>,
    },
    /// Non-terminal asynchronous diagnostic. Does not affect task or
    /// worker state.
    Error { thread_id: Uuid, detail: String },
    /// The execution context died. `task_id` is `Some` if it was running a
    /// task at the time.
    Exit {
        thread_id: Uuid,
        task_id: Option<Uuid>,
        detail: String,
    },
}

struct RunCommand {
    task_id: Uuid,
    payload: Value,
    body: Arc<dyn ExecutionBody>,
}

/// Owned by the pool's dispatcher actor; never shared or locked, because
/// only that actor ever touches it.
pub(crate) struct WorkerHandle {
    pub id: Uuid,
    pub state: WorkerState,
    pub current_task_id: Option<Uuid>,
    cmd_tx: mpsc::Sender<RunCommand>,
    context: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(event_tx: mpsc::UnboundedSender<WorkerEvent>, kind: PoolKind) -> Self {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let context = tokio::spawn(run_execution_context(id, kind, cmd_rx, event_tx));
        Self {
            id,
            state: WorkerState::Idle,
            current_task_id: None,
            cmd_tx,
            context,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Valid only in `Idle`; transitions to `Running` and ships the task to
    /// the execution context.
    pub fn run_task(&mut self, task_id: Uuid, payload: Value, body: Arc<dyn ExecutionBody>) {
        debug_assert!(self.is_idle(), "run_task called on a non-idle worker");
        self.state = WorkerState::Running;
        self.current_task_id = Some(task_id);
        // Capacity 1: a worker only ever has one in-flight command, so this
        // never blocks and should never hit backpressure in correct usage.
        let _ = self.cmd_tx.try_send(RunCommand {
            task_id,
            payload,
            body,
        });
    }

    /// RUNNING -> IDLE on a normal (success or application-level failure)
    /// response.
    pub fn mark_idle(&mut self) {
        self.state = WorkerState::Idle;
        self.current_task_id = None;
    }

    pub fn mark_exited(&mut self) {
        self.state = WorkerState::Exited;
        self.current_task_id = None;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Cancels the context at its next await point. The body runs
        // directly on this task (see `run_execution_context`), so this
        // actually stops an in-flight body rather than an empty shell
        // around it; a body that never awaits will not observe it.
        self.context.abort();
    }
}

/// Extracts a human-readable message from a caught panic payload.
fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

async fn run_execution_context(
    id: Uuid,
    kind: PoolKind,
    mut cmd_rx: mpsc::Receiver<RunCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let diagnostics = Diagnostics {
        thread_id: id,
        tx: event_tx.clone(),
    };

    while let Some(cmd) = cmd_rx.recv().await {
        let body = cmd.body;
        let payload = cmd.payload;
        let task_id = cmd.task_id;
        let diag = diagnostics.clone();

        // `AssertUnwindSafe` is sound here: on a caught panic this task
        // immediately reports `exit` and returns, so no poisoned state from
        // `body`/`diag` is ever observed again.
        let call = AssertUnwindSafe(body.call(payload, kind, &diag)).catch_unwind();

        match call.await {
            Ok(Ok(value)) => {
                let _ = event_tx.send(WorkerEvent::Response {
                    thread_id: id,
                    task_id,
                    result: Ok(value),
                });
            }
            Ok(Err(err)) => {
                let _ = event_tx.send(WorkerEvent::Response {
                    thread_id: id,
                    task_id,
                    result: Err(serde_json::json!({ "error": err.to_string() })),
                });
            }
            Err(panic_payload) => {
                let _ = event_tx.send(WorkerEvent::Exit {
                    thread_id: id,
                    task_id: Some(task_id),
                    detail: panic_detail(panic_payload),
                });
                return;
            }
        }
    }
}
