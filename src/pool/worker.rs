//! Worker threads.
//!
//! Each worker owns one `WorkerRuntime` for its whole life and alternates
//! task consumption with single event-loop ticks: global queue first, then
//! its local queue, then (when enabled) a steal from a busy peer. A worker
//! only counts as idle once it has no queued work, no pending timers and no
//! live contexts, so pool quiescence implies every completion has fired.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, error, info};

use crate::runtime::{CompletionCallback, WorkerRuntime};

use super::{
    PoolCore, PoolError,
    queue::TaskQueue,
    task::{Task, TaskCompletion, TaskPayload},
};

/// Polite sleep when a scan found no task and the loop has nothing pending.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Shared per-thread state record.
pub(crate) struct WorkerState {
    pub(crate) id: usize,
    /// Set by a shrink or shutdown to ask this worker to exit.
    pub(crate) stop: AtomicBool,
    pub(crate) idle: AtomicBool,
    pub(crate) tasks_processed: AtomicU64,
    pub(crate) idle_time_ms: AtomicU64,
    pub(crate) busy_time_ms: AtomicU64,
    pub(crate) local: TaskQueue,
}

pub(crate) struct WorkerSlot {
    pub(crate) state: Arc<WorkerState>,
    pub(crate) handle: Option<JoinHandle<()>>,
}

pub(crate) fn spawn(core: &Arc<PoolCore>, id: usize) -> Result<WorkerSlot, PoolError> {
    let state = Arc::new(WorkerState {
        id,
        stop: AtomicBool::new(false),
        idle: AtomicBool::new(false),
        tasks_processed: AtomicU64::new(0),
        idle_time_ms: AtomicU64::new(0),
        busy_time_ms: AtomicU64::new(0),
        local: TaskQueue::new(core.config.local_queue_size),
    });

    let thread_core = Arc::clone(core);
    let thread_state = Arc::clone(&state);
    let handle = thread::Builder::new()
        .name(format!("krait-worker-{id}"))
        .spawn(move || worker_main(thread_core, thread_state))
        .map_err(PoolError::Spawn)?;

    Ok(WorkerSlot {
        state,
        handle: Some(handle),
    })
}

fn worker_main(core: Arc<PoolCore>, state: Arc<WorkerState>) {
    let mut runtime = match WorkerRuntime::new(core.config.max_contexts) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(worker_id = state.id, "failed to create worker runtime: {err}");
            return;
        }
    };

    state.idle.store(true, Ordering::SeqCst);
    core.idle_threads.fetch_add(1, Ordering::SeqCst);
    core.notify_idle();
    let mut phase_start = Instant::now();
    info!(worker_id = state.id, "worker started");

    while !core.shutdown.load(Ordering::SeqCst) && !state.stop.load(Ordering::SeqCst) {
        let was_idle = state.idle.load(Ordering::SeqCst);

        let task = core
            .queue
            .pop()
            .or_else(|| state.local.pop())
            .or_else(|| {
                if core.config.enable_work_stealing {
                    steal(&core, state.id)
                } else {
                    None
                }
            });

        match task {
            Some(task) => {
                if was_idle {
                    state.idle.store(false, Ordering::SeqCst);
                    core.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    state
                        .idle_time_ms
                        .fetch_add(phase_start.elapsed().as_millis() as u64, Ordering::SeqCst);
                    phase_start = Instant::now();
                }
                execute_task(&mut runtime, task);
                state.tasks_processed.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                // Service outstanding timers before deciding we are idle.
                let has_pending = runtime.run_loop_once();
                let drained = !has_pending && runtime.stats().active_contexts == 0;

                if drained && !was_idle {
                    state.idle.store(true, Ordering::SeqCst);
                    core.idle_threads.fetch_add(1, Ordering::SeqCst);
                    state
                        .busy_time_ms
                        .fetch_add(phase_start.elapsed().as_millis() as u64, Ordering::SeqCst);
                    phase_start = Instant::now();
                    core.notify_idle();
                }
                if !has_pending {
                    thread::sleep(IDLE_SLEEP);
                }
            }
        }
    }

    debug!(worker_id = state.id, "worker exiting");
    // Cancels outstanding timers and fires the remaining completion
    // callbacks exactly once.
    drop(runtime);

    let elapsed = phase_start.elapsed().as_millis() as u64;
    if state.idle.load(Ordering::SeqCst) {
        state.idle.store(false, Ordering::SeqCst);
        core.idle_threads.fetch_sub(1, Ordering::SeqCst);
        state.idle_time_ms.fetch_add(elapsed, Ordering::SeqCst);
    } else {
        state.busy_time_ms.fetch_add(elapsed, Ordering::SeqCst);
    }
}

/// Execute one task on this worker's runtime, wrapping the user callback in
/// the pool's completion accounting.
fn execute_task(runtime: &mut WorkerRuntime, mut task: Task) {
    task.started_at = Some(Instant::now());
    let started = task.started_at.unwrap_or_else(Instant::now);
    let task_id = task.id;
    let pool = task.pool.clone();
    let callback = task.callback.take();

    let on_done: CompletionCallback = Box::new(move || {
        let execution_time = started.elapsed();
        debug!(task_id, ?execution_time, "task completed");
        if let Some(core) = pool.upgrade() {
            core.completed_tasks.fetch_add(1, Ordering::SeqCst);
            core.total_exec_micros
                .fetch_add(execution_time.as_micros() as u64, Ordering::SeqCst);
        }
        if let Some(callback) = callback {
            callback(TaskCompletion {
                task_id,
                execution_time,
            });
        }
        if let Some(core) = pool.upgrade() {
            let _guard = core.wait_lock.lock();
            core.wait_cond.notify_all();
        }
    });

    let result = match &task.payload {
        TaskPayload::Script(source) => runtime.eval_script(source, on_done),
        TaskPayload::Bytecode(image) => runtime.eval_bytecode(image, on_done),
    };
    if let Err(err) = result {
        debug!(task_id, "task evaluation reported failure: {err}");
    }

    // Prime any timers the script scheduled.
    runtime.run_loop_once();
}

/// One pass over the peers from a random starting point, skipping self and
/// idle victims. A victim keeps at least one task.
fn steal(core: &Arc<PoolCore>, thief_id: usize) -> Option<Task> {
    let slots = core.workers.read();
    let count = slots.len();
    if count <= 1 {
        return None;
    }

    let start = rand::rng().random_range(0..count);
    for offset in 0..count {
        let victim_id = (start + offset) % count;
        if victim_id == thief_id {
            continue;
        }
        let Some(victim) = slots.get(victim_id) else {
            continue;
        };
        if victim.state.idle.load(Ordering::SeqCst) {
            continue;
        }
        if let Some(mut task) = victim.state.local.steal() {
            // Stolen tasks are re-tagged so completion accounting lands on
            // the executing pool.
            task.pool = Arc::downgrade(core);
            debug!(thief_id, victim_id, task_id = task.id, "stole task");
            return Some(task);
        }
    }
    None
}
