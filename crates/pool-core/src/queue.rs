//! Bounded FIFO of pending tasks with id-indexed lookup.
//!
//! `tasks` indexes every task the pool still considers live — queued *or*
//! currently running on a worker — so a task's retry accounting stays
//! reachable for as long as the pool considers it live. `pending_order` is
//! the actual FIFO:
//! only ids waiting for a worker live there, so a task dispatched straight
//! off `send` (never queued) is still retryable through [`TaskQueue::retry_task`]
//! once it fails, because it's still indexed in `tasks`.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::task::Task;

pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    pending_order: VecDeque<Uuid>,
    max_length: usize,
}

impl TaskQueue {
    pub fn new(max_length: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            pending_order: VecDeque::new(),
            max_length,
        }
    }

    /// Number of tasks currently waiting (not counting ones already
    /// dispatched to a worker).
    pub fn len(&self) -> usize {
        self.pending_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_order.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending_order.len() >= self.max_length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// The bound is mutable at runtime but never drops below the current
    /// length at the moment of the set — lowering it simply caps future
    /// pushes, it does not evict anything already waiting.
    pub fn set_max_length(&mut self, n: usize) {
        self.max_length = n.max(self.pending_order.len());
    }

    /// Registers the task and appends it to the tail. Returns `false`
    /// (dropping the task) if the queue is already at `max_length`.
    pub fn push(&mut self, task: Task) -> bool {
        if self.is_full() {
            return false;
        }
        let id = task.id;
        self.pending_order.push_back(id);
        self.tasks.insert(id, task);
        true
    }

    /// Dequeues the head task for dispatch. The task stays indexed by id
    /// (it is now implicitly "running") until [`TaskQueue::remove_task`]
    /// or [`TaskQueue::wipe`] drops it.
    pub fn pop(&mut self) -> Option<Task> {
        let id = self.pending_order.pop_front()?;
        self.tasks.get(&id).cloned()
    }

    pub fn get_task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Indexes a task as running (dispatched straight to a worker) without
    /// placing it in the wait order. A task popped off the queue is already
    /// indexed here (`pop` only drains `pending_order`), so this only
    /// matters for a task that skipped the queue entirely via grow-first
    /// placement; it stays harmless to call on an already-indexed task.
    pub fn register_running(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    /// Removes a task from any position — waiting or running — and drops
    /// its id-index entry.
    pub fn remove_task(&mut self, id: Uuid) -> bool {
        let existed = self.tasks.remove(&id).is_some();
        if existed {
            self.pending_order.retain(|&x| x != id);
        }
        existed
    }

    /// If the task is retryable, decrements its retry counter and moves it
    /// to the tail of the FIFO (re-inserting it into the wait order if it
    /// wasn't already there — e.g. a task dispatched straight to a fresh
    /// worker that never previously waited). Otherwise returns `false`.
    ///
    /// This is the single point where retry accounting happens for a
    /// queued-or-just-completed task.
    pub fn retry_task(&mut self, id: Uuid) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if !task.is_retryable() {
            return false;
        }
        task.decrement_retry();
        self.pending_order.retain(|&x| x != id);
        self.pending_order.push_back(id);
        true
    }

    /// Empties the queue, returning every task that was waiting so the
    /// caller can settle their completion handles. Tasks already dispatched
    /// to a worker (not in the wait order) are untouched and will complete
    /// normally.
    pub fn wipe(&mut self) -> Vec<Task> {
        let ids: Vec<Uuid> = self.pending_order.drain(..).collect();
        ids.into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .collect()
    }
}
