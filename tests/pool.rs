//! End-to-end scenarios driving pools of real worker runtimes.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use krait::{PoolConfig, PoolError, TaskCompletion, ThreadPool, WaitOutcome, compile_script};

fn test_config() -> PoolConfig {
    PoolConfig {
        thread_count: 2,
        max_contexts: 4,
        global_queue_size: 16,
        local_queue_size: 4,
        enable_work_stealing: true,
        idle_threshold: 2,
        dynamic_sizing: false,
    }
}

fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(TaskCompletion) + Send + 'static {
    let counter = Arc::clone(counter);
    move |_completion| {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// A script that keeps the worker's synchronous portion busy for roughly the
/// given wall-clock time, independent of interpreter speed.
fn busy_script(millis: u64) -> String {
    format!("const end = Date.now() + {millis}; while (Date.now() < end) {{}}")
}

/// Spin until the global queue is drained, so the single worker is known to
/// have picked up the task in flight.
fn wait_until_dequeued(pool: &ThreadPool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stats().queued_tasks > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(pool.stats().queued_tasks, 0, "worker never picked up the task");
}

#[test]
fn immediate_completion() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task("1 + 1", counting(&hits)).unwrap();

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let stats = pool.stats();
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.total_tasks, 1);
    pool.shutdown();
}

#[test]
fn single_timer_completes() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task("setTimeout(() => {}, 50)", counting(&hits))
        .unwrap();

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().completed_tasks, 1);
    pool.shutdown();
}

#[test]
fn interval_cleared_after_three_ticks() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task(
        "let n = 0; const h = setInterval(() => { if (++n === 3) clearInterval(h); }, 20);",
        counting(&hits),
    )
    .unwrap();

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().completed_tasks, 1);
    pool.shutdown();
}

#[test]
fn backpressure_reports_full() {
    let config = PoolConfig {
        thread_count: 1,
        global_queue_size: 2,
        enable_work_stealing: false,
        ..test_config()
    };
    let pool = ThreadPool::new(config).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let busy = busy_script(400);

    // Occupy the only worker, then fill the bounded queue.
    pool.add_script_task(&busy, counting(&hits)).unwrap();
    wait_until_dequeued(&pool);
    pool.add_script_task(&busy, counting(&hits)).unwrap();
    pool.add_script_task(&busy, counting(&hits)).unwrap();

    let started = Instant::now();
    let overflow = pool.add_script_task(&busy, counting(&hits));
    assert!(matches!(overflow, Err(PoolError::QueueFull)));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "submission blocked for {:?}",
        started.elapsed()
    );

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(30))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.completed_tasks, 3);
    assert_eq!(stats.total_tasks, 3);
    pool.shutdown();
}

#[test]
fn engine_exception_still_completes() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task("throw new Error('x')", counting(&hits))
        .unwrap();

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().completed_tasks, 1);
    pool.shutdown();
}

#[test]
fn mixed_burst() {
    let pool = ThreadPool::new(PoolConfig {
        global_queue_size: 0,
        ..test_config()
    })
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for index in 0..100 {
        let script = if index % 2 == 0 {
            "1"
        } else {
            "setTimeout(() => {}, 10)"
        };
        pool.add_script_task(script, counting(&hits)).unwrap();
    }

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(60))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 100);
    let stats = pool.stats();
    assert_eq!(stats.completed_tasks, 100);
    assert_eq!(stats.total_tasks, 100);
    assert_eq!(stats.queued_tasks, 0);
    pool.shutdown();
}

#[test]
fn bytecode_round_trip() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let image = compile_script("6 * 7").unwrap();
    pool.add_bytecode_task(&image, counting(&hits)).unwrap();

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().completed_tasks, 1);
    pool.shutdown();
}

#[test]
fn cleared_timeout_never_fires() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task(
        "const h = setTimeout(() => { throw new Error('must not run'); }, 30); clearTimeout(h);",
        counting(&hits),
    )
    .unwrap();

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().completed_tasks, 1);
    pool.shutdown();
}

#[test]
fn shutdown_with_pending_timers_fires_callbacks() {
    let pool = ThreadPool::new(PoolConfig {
        thread_count: 1,
        ..test_config()
    })
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task("setTimeout(() => {}, 60000)", counting(&hits))
        .unwrap();
    wait_until_dequeued(&pool);

    // Shutdown joins the worker, whose runtime teardown cancels the timer
    // and still reports completion.
    pool.shutdown();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_for_idle_times_out_under_load() {
    let pool = ThreadPool::new(PoolConfig {
        thread_count: 1,
        enable_work_stealing: false,
        ..test_config()
    })
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.add_script_task(&busy_script(500), counting(&hits))
        .unwrap();
    wait_until_dequeued(&pool);

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_millis(10))),
        WaitOutcome::TimedOut
    );
    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(30))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    pool.shutdown();
}

#[test]
fn single_thread_without_stealing_makes_progress() {
    let pool = ThreadPool::new(PoolConfig {
        thread_count: 1,
        enable_work_stealing: false,
        global_queue_size: 0,
        ..test_config()
    })
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        pool.add_script_task("1 + 1", counting(&hits)).unwrap();
    }

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(30))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert_eq!(pool.stats().completed_tasks, 10);
    pool.shutdown();
}

#[test]
fn resize_grows_and_shrinks() {
    let pool = ThreadPool::new(test_config()).unwrap();

    pool.resize(4).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.active_threads + stats.idle_threads, 4);
    assert!(pool.thread_stats(3).is_some());

    pool.resize(1).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.active_threads + stats.idle_threads, 1);
    assert!(pool.thread_stats(1).is_none());

    assert!(pool.resize(0).is_err());

    // The shrunk pool still executes work.
    let hits = Arc::new(AtomicUsize::new(0));
    pool.add_script_task("1 + 1", counting(&hits)).unwrap();
    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(10))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    pool.shutdown();
}

#[test]
fn submission_after_shutdown_is_rejected() {
    let pool = ThreadPool::new(test_config()).unwrap();
    pool.shutdown();
    let result = pool.add_script_task("1", |_completion| {});
    assert!(matches!(result, Err(PoolError::Shutdown)));
}

#[test]
fn dynamic_pool_runs_and_shuts_down() {
    let pool = ThreadPool::new(PoolConfig {
        thread_count: 2,
        dynamic_sizing: true,
        idle_threshold: 4,
        ..test_config()
    })
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        pool.add_script_task("1 + 1", counting(&hits)).unwrap();
    }

    assert_eq!(
        pool.wait_for_idle(Some(Duration::from_secs(30))),
        WaitOutcome::Idle
    );
    assert_eq!(hits.load(Ordering::SeqCst), 8);
    pool.shutdown();
}

#[test]
fn completion_reports_execution_time_and_id() {
    let pool = ThreadPool::new(test_config()).unwrap();
    let (sender, receiver) = std::sync::mpsc::channel::<TaskCompletion>();

    let task_id = pool
        .add_script_task(&busy_script(20), move |completion| {
            let _ = sender.send(completion);
        })
        .unwrap();

    let completion = receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("completion callback fired");
    assert_eq!(completion.task_id, task_id);
    assert!(completion.execution_time >= Duration::from_millis(15));
    pool.shutdown();
}
