//! Task records.

use std::{
    sync::Weak,
    time::{Duration, Instant},
};

use super::PoolCore;

/// What a task evaluates. Both variants own copies made at submission.
pub(crate) enum TaskPayload {
    Script(String),
    Bytecode(Vec<u8>),
}

/// Completion report handed to the submitter's callback.
#[derive(Debug, Clone, Copy)]
pub struct TaskCompletion {
    /// Pool-unique task id, as returned by the submission call.
    pub task_id: u64,
    /// Wall-clock time from execution start to context destruction.
    pub execution_time: Duration,
}

/// Caller-supplied completion callback. Invoked exactly once per
/// successfully enqueued task, on the worker thread that executed it, after
/// the task's context has been destroyed. It may submit further tasks but
/// must not block on pool quiescence.
pub type TaskCallback = Box<dyn FnOnce(TaskCompletion) + Send + 'static>;

/// A submitted unit of work. Owned by the queue while enqueued and by a
/// worker while executing; released after the completion callback returns.
pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) payload: TaskPayload,
    pub(crate) callback: Option<TaskCallback>,
    /// Non-owning back-pointer to the pool; re-tagged when the task is
    /// stolen onto another worker.
    pub(crate) pool: Weak<PoolCore>,
    pub(crate) started_at: Option<Instant>,
}
