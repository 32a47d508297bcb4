//! Bounded worker-thread pool dispatcher: a fixed-size pool of execution
//! contexts that tasks are admitted into under a grow-first placement
//! policy, retried on application-level failure up to a per-task budget,
//! and drained periodically so nothing waits forever once capacity frees
//! up.
//!
//! The crate's four pieces map one-to-one onto the modules below: a
//! [`task`] is one submission; a [`queue`] holds the ones waiting for a
//! worker; a [`worker`] owns one execution context; and [`pool`] is the
//! actor that ties placement, retry, and drain together behind a small
//! async API.

pub mod body;
pub mod error;
pub mod pool;
pub mod queue;
pub mod task;
pub(crate) mod worker;

pub use body::{closure, ClosureBody, Diagnostics, ExecutionBody, PoolKind};
pub use error::{PoolError, PoolResult};
pub use pool::{Pool, PoolEvent, PoolOptions, PoolSnapshot, TaskHandle};
pub use task::{ExecKind, Task, TaskOptions, MAX_TASK_RETRY};
