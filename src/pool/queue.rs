//! Bounded FIFO task queue.
//!
//! Producers wait up to 100 ms for space on a bounded queue before giving
//! up; consumers wait at most 10 ms for work so they can observe the pool's
//! shutdown flag and their own stop flag. Timeouts are the only non-FIFO
//! behaviour and never reorder tasks relative to their enqueue.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::{PoolError, task::Task};

/// How long a producer waits for space before reporting the queue full.
const PUSH_WAIT: Duration = Duration::from_millis(100);
/// How long a consumer waits for work before returning empty-handed.
const POP_WAIT: Duration = Duration::from_millis(10);

pub(crate) struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    not_empty: Condvar,
    not_full: Condvar,
    /// 0 means unbounded.
    max_size: usize,
}

impl TaskQueue {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Append to the tail, waiting for space on a bounded queue. The task is
    /// dropped (its payload freed) when the wait times out.
    pub(crate) fn push(&self, task: Task) -> Result<(), PoolError> {
        let mut tasks = self.tasks.lock();
        if self.max_size > 0 {
            let deadline = Instant::now() + PUSH_WAIT;
            while tasks.len() >= self.max_size {
                if self.not_full.wait_until(&mut tasks, deadline).timed_out() {
                    return Err(PoolError::QueueFull);
                }
            }
        }
        tasks.push_back(task);
        drop(tasks);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the head, waiting briefly when empty.
    pub(crate) fn pop(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            let deadline = Instant::now() + POP_WAIT;
            while tasks.is_empty() {
                if self.not_empty.wait_until(&mut tasks, deadline).timed_out() {
                    break;
                }
            }
            if tasks.is_empty() {
                return None;
            }
        }
        let task = tasks.pop_front();
        drop(tasks);
        if task.is_some() && self.max_size > 0 {
            self.not_full.notify_one();
        }
        task
    }

    /// Detach the head without waiting. Only succeeds when the lock is
    /// uncontended and the owner has more than one queued task.
    pub(crate) fn steal(&self) -> Option<Task> {
        let mut tasks = self.tasks.try_lock()?;
        if tasks.len() > 1 {
            tasks.pop_front()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::task::TaskPayload;
    use std::sync::Weak;

    fn task(id: u64) -> Task {
        Task {
            id,
            payload: TaskPayload::Script(String::new()),
            callback: None,
            pool: Weak::new(),
            started_at: None,
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let queue = TaskQueue::new(0);
        for id in 0..3 {
            queue.push(task(id)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for id in 0..3 {
            assert_eq!(queue.pop().map(|t| t.id), Some(id));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn bounded_queue_reports_full_after_the_wait() {
        let queue = TaskQueue::new(2);
        queue.push(task(1)).unwrap();
        queue.push(task(2)).unwrap();

        let started = Instant::now();
        let result = queue.push(task(3));
        assert!(matches!(result, Err(PoolError::QueueFull)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "waited {elapsed:?}");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn unbounded_queue_never_reports_full() {
        let queue = TaskQueue::new(0);
        for id in 0..100 {
            queue.push(task(id)).unwrap();
        }
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn empty_pop_times_out_quickly() {
        let queue = TaskQueue::new(0);
        let started = Instant::now();
        assert!(queue.pop().is_none());
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn steal_leaves_at_least_one_task() {
        let queue = TaskQueue::new(0);
        queue.push(task(1)).unwrap();
        assert!(queue.steal().is_none());

        queue.push(task(2)).unwrap();
        assert_eq!(queue.steal().map(|t| t.id), Some(1));
        assert_eq!(queue.len(), 1);
        assert!(queue.steal().is_none());
    }
}
