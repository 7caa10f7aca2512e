//! Krait - an embedded JavaScript task executor powered by the Boa JS engine
//!
//! Krait runs many short JavaScript workloads concurrently without letting
//! them interfere with one another:
//! - A thread pool with a global FIFO queue, per-worker local queues and
//!   work stealing
//! - One Boa-backed worker runtime per thread, with its own event loop and
//!   timer table, hosting a short-lived context per task
//! - Timers (`setTimeout`/`setInterval`) that drive asynchronous task
//!   completion, reported through caller-supplied callbacks

pub mod logging;
pub mod pool;
pub mod runtime;

// Re-export commonly used types
pub use pool::{
    PoolConfig, PoolError, PoolStats, TaskCallback, TaskCompletion, ThreadPool, ThreadStats,
    WaitOutcome,
};
pub use runtime::{RuntimeError, RuntimeStats, WorkerRuntime, compile_script};
