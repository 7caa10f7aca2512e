//! The thread pool.
//!
//! A fixed or dynamically sized set of worker threads, a global FIFO queue,
//! per-worker local queues with work stealing, and quiescence signalling.
//! Submissions copy their payload, get a pool-unique id and always land in
//! the global queue; workers prefer it over their local queue and stealing.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

mod adjuster;
mod queue;
mod task;
mod worker;

pub use task::{TaskCallback, TaskCompletion};

use queue::TaskQueue;
use task::{Task, TaskPayload};
use worker::WorkerSlot;

/// Errors surfaced by pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("global task queue is full")]
    QueueFull,

    #[error("thread pool is shut down")]
    Shutdown,

    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Pool configuration. All fields are required; `Default` sizes the pool to
/// the machine.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker threads to start with. Must be at least 1.
    pub thread_count: usize,
    /// Live-context cap per worker runtime. Must be at least 1.
    pub max_contexts: usize,
    /// Global queue capacity; 0 means unbounded.
    pub global_queue_size: usize,
    /// Per-worker local queue capacity; 0 means unbounded.
    pub local_queue_size: usize,
    /// Let idle workers steal from busy peers' local queues.
    pub enable_work_stealing: bool,
    /// Idle-worker count above which the adjuster shrinks the pool.
    pub idle_threshold: usize,
    /// Start the adjuster thread.
    pub dynamic_sizing: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_count: num_cpus::get().max(1),
            max_contexts: 8,
            global_queue_size: 0,
            local_queue_size: 0,
            enable_work_stealing: true,
            idle_threshold: 2,
            dynamic_sizing: false,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.thread_count == 0 {
            return Err(PoolError::Config("thread_count must be at least 1".into()));
        }
        if self.max_contexts == 0 {
            return Err(PoolError::Config("max_contexts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Pool-wide snapshot.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub active_threads: usize,
    pub idle_threads: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub total_tasks: u64,
    /// Share of aggregated worker time spent busy, in percent.
    pub thread_utilization: f64,
    /// Best-effort; absent until a task has completed.
    pub avg_execution_time: Option<Duration>,
}

/// Per-thread counters snapshot.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    pub thread_id: usize,
    pub idle: bool,
    pub tasks_processed: u64,
    pub idle_time: Duration,
    pub busy_time: Duration,
}

/// Outcome of a quiescence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Global queue empty and every worker idle.
    Idle,
    TimedOut,
}

/// State shared between the pool handle, its workers and the adjuster.
///
/// Lock ordering: `wait_lock` may be taken before the worker-table lock or a
/// queue mutex, never the other way around; the worker-table write lock is
/// released before joining threads or signalling waiters.
pub(crate) struct PoolCore {
    pub(crate) config: PoolConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) workers: RwLock<Vec<WorkerSlot>>,
    pub(crate) shutdown: AtomicBool,
    /// Also the task-id allocator.
    pub(crate) total_tasks: AtomicU64,
    pub(crate) completed_tasks: AtomicU64,
    pub(crate) total_exec_micros: AtomicU64,
    pub(crate) idle_threads: AtomicUsize,
    pub(crate) wait_lock: Mutex<()>,
    pub(crate) wait_cond: Condvar,
    pub(crate) idle_lock: Mutex<()>,
    pub(crate) idle_cond: Condvar,
    pub(crate) adjuster_running: AtomicBool,
}

impl PoolCore {
    fn is_quiescent(&self) -> bool {
        self.queue.len() == 0
            && self.idle_threads.load(Ordering::SeqCst) >= self.workers.read().len()
    }

    /// Signal the adjuster and any quiescence waiters that a worker went
    /// idle.
    pub(crate) fn notify_idle(&self) {
        {
            let _guard = self.idle_lock.lock();
            self.idle_cond.notify_all();
        }
        {
            let _guard = self.wait_lock.lock();
            self.wait_cond.notify_all();
        }
    }

    pub(crate) fn wait_for_idle(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = self.wait_lock.lock();
        loop {
            if self.is_quiescent() {
                return WaitOutcome::Idle;
            }
            match deadline {
                Some(deadline) => {
                    if self.wait_cond.wait_until(&mut guard, deadline).timed_out() {
                        return if self.is_quiescent() {
                            WaitOutcome::Idle
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.wait_cond.wait(&mut guard),
            }
        }
    }

    pub(crate) fn resize(self: &Arc<Self>, new_count: usize) -> Result<(), PoolError> {
        if new_count == 0 {
            return Err(PoolError::Config("thread_count must be at least 1".into()));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }

        let mut slots = self.workers.write();
        let current = slots.len();
        if new_count == current {
            return Ok(());
        }

        if new_count > current {
            for id in current..new_count {
                slots.push(worker::spawn(self, id)?);
            }
            info!(from = current, to = new_count, "thread pool grown");
            return Ok(());
        }

        // Shrink: request the tail workers to exit, join them with the table
        // lock released, then truncate. Vec capacity is retained so regrowth
        // is allocation-free.
        for slot in &slots[new_count..] {
            slot.state.stop.store(true, Ordering::SeqCst);
        }
        let handles: Vec<JoinHandle<()>> = slots[new_count..]
            .iter_mut()
            .filter_map(|slot| slot.handle.take())
            .collect();
        drop(slots);

        for handle in handles {
            let _ = handle.join();
        }

        let mut slots = self.workers.write();
        slots.truncate(new_count);
        drop(slots);

        {
            let _guard = self.wait_lock.lock();
            self.wait_cond.notify_all();
        }
        info!(from = current, to = new_count, "thread pool shrunk");
        Ok(())
    }
}

/// A pool of worker threads evaluating JavaScript tasks.
pub struct ThreadPool {
    core: Arc<PoolCore>,
    adjuster: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Build and start a pool.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let core = Arc::new(PoolCore {
            queue: TaskQueue::new(config.global_queue_size),
            workers: RwLock::new(Vec::with_capacity(config.thread_count)),
            shutdown: AtomicBool::new(false),
            total_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            total_exec_micros: AtomicU64::new(0),
            idle_threads: AtomicUsize::new(0),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
            adjuster_running: AtomicBool::new(false),
            config,
        });

        {
            let mut slots = core.workers.write();
            for id in 0..core.config.thread_count {
                match worker::spawn(&core, id) {
                    Ok(slot) => slots.push(slot),
                    Err(err) => {
                        // Release what was started, in reverse order.
                        core.shutdown.store(true, Ordering::SeqCst);
                        let handles: Vec<_> = slots
                            .iter_mut()
                            .rev()
                            .filter_map(|slot| slot.handle.take())
                            .collect();
                        slots.clear();
                        drop(slots);
                        for handle in handles {
                            let _ = handle.join();
                        }
                        return Err(err);
                    }
                }
            }
        }

        let pool = Self {
            core,
            adjuster: Mutex::new(None),
        };

        if pool.core.config.dynamic_sizing {
            pool.core.adjuster_running.store(true, Ordering::SeqCst);
            match adjuster::spawn(&pool.core) {
                Ok(handle) => *pool.adjuster.lock() = Some(handle),
                Err(err) => {
                    // The pool still works, just without dynamic sizing.
                    pool.core.adjuster_running.store(false, Ordering::SeqCst);
                    tracing::warn!("failed to start pool adjuster: {err}");
                }
            }
        }

        info!(
            threads = pool.core.config.thread_count,
            "thread pool initialised"
        );
        Ok(pool)
    }

    /// Submit a script task. The source is copied; the returned id is unique
    /// within this pool.
    pub fn add_script_task(
        &self,
        script: &str,
        callback: impl FnOnce(TaskCompletion) + Send + 'static,
    ) -> Result<u64, PoolError> {
        self.submit(TaskPayload::Script(script.to_owned()), Box::new(callback))
    }

    /// Submit a compiled task image (see [`crate::runtime::compile_script`]).
    /// The bytes are copied.
    pub fn add_bytecode_task(
        &self,
        image: &[u8],
        callback: impl FnOnce(TaskCompletion) + Send + 'static,
    ) -> Result<u64, PoolError> {
        self.submit(TaskPayload::Bytecode(image.to_vec()), Box::new(callback))
    }

    fn submit(&self, payload: TaskPayload, callback: TaskCallback) -> Result<u64, PoolError> {
        if self.core.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        let id = self.core.total_tasks.fetch_add(1, Ordering::SeqCst);
        let task = Task {
            id,
            payload,
            callback: Some(callback),
            pool: Arc::downgrade(&self.core),
            started_at: None,
        };
        match self.core.queue.push(task) {
            Ok(()) => {
                debug!(task_id = id, "task enqueued");
                Ok(id)
            }
            Err(err) => {
                // Failed submissions do not count towards quiescence.
                self.core.total_tasks.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Block until the global queue is empty and every worker is idle.
    /// `None` waits indefinitely.
    pub fn wait_for_idle(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.core.wait_for_idle(timeout)
    }

    /// Grow or shrink the worker set.
    pub fn resize(&self, new_thread_count: usize) -> Result<(), PoolError> {
        self.core.resize(new_thread_count)
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        let slots = self.core.workers.read();
        let thread_count = slots.len();
        let mut idle_ms = 0u64;
        let mut busy_ms = 0u64;
        for slot in slots.iter() {
            idle_ms += slot.state.idle_time_ms.load(Ordering::SeqCst);
            busy_ms += slot.state.busy_time_ms.load(Ordering::SeqCst);
        }
        drop(slots);

        let idle_threads = self
            .core
            .idle_threads
            .load(Ordering::SeqCst)
            .min(thread_count);
        let completed = self.core.completed_tasks.load(Ordering::SeqCst);
        let utilization = if idle_ms + busy_ms > 0 {
            busy_ms as f64 / (idle_ms + busy_ms) as f64 * 100.0
        } else {
            0.0
        };

        PoolStats {
            active_threads: thread_count - idle_threads,
            idle_threads,
            queued_tasks: self.core.queue.len(),
            completed_tasks: completed,
            total_tasks: self.core.total_tasks.load(Ordering::SeqCst),
            thread_utilization: utilization,
            avg_execution_time: (completed > 0).then(|| {
                Duration::from_micros(
                    self.core.total_exec_micros.load(Ordering::SeqCst) / completed,
                )
            }),
        }
    }

    /// Per-thread counters, or `None` for an unknown id.
    pub fn thread_stats(&self, thread_id: usize) -> Option<ThreadStats> {
        let slots = self.core.workers.read();
        let slot = slots.get(thread_id)?;
        Some(ThreadStats {
            thread_id,
            idle: slot.state.idle.load(Ordering::SeqCst),
            tasks_processed: slot.state.tasks_processed.load(Ordering::SeqCst),
            idle_time: Duration::from_millis(slot.state.idle_time_ms.load(Ordering::SeqCst)),
            busy_time: Duration::from_millis(slot.state.busy_time_ms.load(Ordering::SeqCst)),
        })
    }

    /// Stop the adjuster, join every worker and drain the queues. Idempotent
    /// and infallible; also run on drop.
    pub fn shutdown(&self) {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down thread pool");

        if self.core.adjuster_running.swap(false, Ordering::SeqCst) {
            {
                let _guard = self.core.idle_lock.lock();
                self.core.idle_cond.notify_all();
            }
            if let Some(handle) = self.adjuster.lock().take() {
                let _ = handle.join();
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.core.workers.write();
            slots
                .iter_mut()
                .filter_map(|slot| slot.handle.take())
                .collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        // Dropping the slots drains the per-thread local queues.
        self.core.workers.write().clear();

        info!(
            completed = self.core.completed_tasks.load(Ordering::SeqCst),
            "thread pool shut down"
        );
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_thread_count_is_rejected() {
        let config = PoolConfig {
            thread_count: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));
        assert!(ThreadPool::new(config).is_err());
    }

    #[test]
    fn zero_max_contexts_is_rejected() {
        let config = PoolConfig {
            max_contexts: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));
    }
}
