//! Per-thread JavaScript worker runtime.
//!
//! A `WorkerRuntime` owns one event loop, one timer table and a set of
//! short-lived contexts, and is bound to the thread that created it. Every
//! task gets a fresh context with the host built-ins (`console`,
//! `setTimeout`, `clearTimeout`, `setInterval`, `clearInterval`) installed;
//! the context is destroyed as soon as evaluation is done and its last timer
//! has fired or been cancelled, at which point the recorded completion
//! callback fires exactly once.

use std::{rc::Rc, time::Instant};

use boa_engine::{
    Context, JsValue, Module, Source, builtins::promise::PromiseState,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

mod bytecode;
mod console;
mod context;
mod event_loop;
mod timers;

pub use bytecode::compile_script;
pub use context::CompletionCallback;

use context::{ContextState, WorkerContext};
use event_loop::EventLoop;
use timers::TimerTable;

/// Errors surfaced by a worker runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("JavaScript error: {0}")]
    Js(String),

    #[error("invalid runtime configuration: {0}")]
    Config(String),

    #[error("context limit reached ({0} live contexts)")]
    ContextLimit(usize),

    #[error("invalid task image: {0}")]
    Bytecode(String),
}

/// Snapshot of a runtime's live state.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStats {
    pub active_contexts: usize,
    pub max_contexts: usize,
    pub active_timers: usize,
}

/// Counters guarded by the runtime's own mutex, separate from the timer
/// table's lock.
pub(crate) struct RuntimeCounters {
    next_timer_id: u32,
    context_count: usize,
}

/// Runtime internals reachable from the timer built-ins.
pub(crate) struct RuntimeShared {
    pub(crate) timer_table: TimerTable,
    pub(crate) event_loop: EventLoop,
    counters: Mutex<RuntimeCounters>,
}

impl RuntimeShared {
    /// Next timer id; wraps back to 1 past the integer maximum. Stale table
    /// entries are removed on close, so reuse after a wrap is harmless.
    pub(crate) fn next_timer_id(&self) -> u32 {
        let mut counters = self.counters.lock();
        let id = counters.next_timer_id;
        counters.next_timer_id = if id == u32::MAX { 1 } else { id + 1 };
        id
    }
}

pub struct WorkerRuntime {
    shared: Rc<RuntimeShared>,
    contexts: Vec<WorkerContext>,
    max_contexts: usize,
    next_context_id: u32,
}

impl WorkerRuntime {
    /// Build a runtime bound to the calling thread.
    pub fn new(max_contexts: usize) -> Result<Self, RuntimeError> {
        if max_contexts == 0 {
            return Err(RuntimeError::Config(
                "max_contexts must be at least 1".into(),
            ));
        }
        Ok(Self {
            shared: Rc::new(RuntimeShared {
                timer_table: TimerTable::new(),
                event_loop: EventLoop::new(),
                counters: Mutex::new(RuntimeCounters {
                    next_timer_id: 1,
                    context_count: 0,
                }),
            }),
            contexts: Vec::new(),
            max_contexts,
            next_context_id: 0,
        })
    }

    /// Set up a fresh context with the host built-ins installed. Fails when
    /// the live-context cap is reached.
    fn new_context(&mut self) -> Result<usize, RuntimeError> {
        {
            let counters = self.shared.counters.lock();
            if counters.context_count >= self.max_contexts {
                return Err(RuntimeError::ContextLimit(counters.context_count));
            }
        }

        let mut context = Context::default();
        let state = Rc::new(ContextState::new(self.next_context_id));
        self.next_context_id = self.next_context_id.wrapping_add(1);

        console::install_console(&mut context)
            .map_err(|err| RuntimeError::Js(err.to_string()))?;
        timers::install_timer_builtins(&mut context, state.clone(), self.shared.clone())
            .map_err(|err| RuntimeError::Js(err.to_string()))?;

        self.shared.counters.lock().context_count += 1;
        self.contexts.push(WorkerContext::new(context, state));
        Ok(self.contexts.len() - 1)
    }

    /// Evaluate a script as a module on a fresh context. `on_done` fires
    /// exactly once, after that context has been destroyed.
    pub fn eval_script(
        &mut self,
        source: &str,
        on_done: CompletionCallback,
    ) -> Result<(), RuntimeError> {
        self.eval_module(source, on_done)
    }

    /// Evaluate a compiled task image: decode, then parse and execute.
    pub fn eval_bytecode(
        &mut self,
        image: &[u8],
        on_done: CompletionCallback,
    ) -> Result<(), RuntimeError> {
        match bytecode::decode(image) {
            Ok(source) => self.eval_module(source, on_done),
            Err(err) => {
                warn!("rejecting task image: {err}");
                on_done();
                Err(err)
            }
        }
    }

    fn eval_module(
        &mut self,
        source: &str,
        on_done: CompletionCallback,
    ) -> Result<(), RuntimeError> {
        let index = match self.new_context() {
            Ok(index) => index,
            Err(err) => {
                warn!("failed to create evaluation context: {err}");
                on_done();
                return Err(err);
            }
        };
        self.contexts[index].set_on_done(on_done);

        let failure = {
            let worker = &mut self.contexts[index];
            let evaluated =
                Module::parse(Source::from_bytes(source.as_bytes()), None, &mut worker.context)
                    .map(|module| module.load_link_evaluate(&mut worker.context));
            worker.drain_microtasks();
            match evaluated {
                Ok(promise) => match promise.state() {
                    PromiseState::Rejected(err) => {
                        let message = err
                            .to_string(&mut worker.context)
                            .map(|s| s.to_std_string_escaped())
                            .unwrap_or_else(|_| "unknown error".into());
                        Some(RuntimeError::Js(message))
                    }
                    PromiseState::Fulfilled(_) | PromiseState::Pending => None,
                },
                Err(err) => Some(RuntimeError::Js(err.to_string())),
            }
        };

        let state = self.contexts[index].state.clone();
        state.mark_pending_free();

        if let Some(err) = failure {
            warn!("task evaluation failed: {err}");
            if state.active_timers() == 0 {
                self.free_context(state.id());
            }
            return Err(err);
        }

        if state.active_timers() == 0 {
            self.free_context(state.id());
            boa_gc::force_collect();
        }
        Ok(())
    }

    /// Advance the event loop by one non-blocking tick. Returns whether
    /// timer work remains pending.
    pub fn run_loop_once(&mut self) -> bool {
        // Finalise cancellations first so a cleared timer can never fire.
        for state in self.shared.event_loop.take_released() {
            state.release_timer();
            if state.ready_to_free() {
                self.free_context(state.id());
            }
        }

        for timer_id in self.shared.event_loop.take_due(Instant::now()) {
            let Some((callback, interval, delay, state)) =
                self.shared.timer_table.fire_info(timer_id)
            else {
                continue; // cleared before it came due
            };
            let Some(index) = self
                .contexts
                .iter()
                .position(|c| c.state.id() == state.id())
            else {
                // Owning context already torn down.
                let _ = self.shared.timer_table.take(timer_id);
                continue;
            };

            {
                let worker = &mut self.contexts[index];
                if let Err(err) =
                    callback.call(&JsValue::undefined(), &[], &mut worker.context)
                {
                    warn!(timer_id, "timer callback exception: {err}");
                }
                worker.drain_microtasks();
            }

            if interval {
                // Re-arm unless the callback cleared itself.
                if self.shared.timer_table.contains(timer_id) {
                    self.shared.event_loop.schedule(timer_id, delay);
                }
                continue;
            }

            // One-shot close: release the retained callback, drop the table
            // entry and settle the owning context's timer accounting.
            if self.shared.timer_table.take(timer_id).is_some() {
                state.release_timer();
                if state.ready_to_free() {
                    self.free_context(state.id());
                }
            }
        }

        self.shared.event_loop.has_pending()
    }

    /// Drive the loop until quiescent, sleeping until the next deadline
    /// between ticks (capped at 10 ms to stay responsive).
    pub fn run_loop(&mut self) {
        while self.run_loop_once() {
            if let Some(wait) = self.shared.event_loop.time_until_next_timer() {
                if !wait.is_zero() {
                    std::thread::sleep(wait.min(std::time::Duration::from_millis(10)));
                }
            }
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            active_contexts: self.shared.counters.lock().context_count,
            max_contexts: self.max_contexts,
            active_timers: self.shared.timer_table.live_timers(),
        }
    }

    /// Stop and release every timer owned by the context so a free is always
    /// possible. Teardown path.
    fn cancel_context_timers(&mut self, context_id: u32) {
        let removed = self.shared.timer_table.take_for_context(context_id);
        if !removed.is_empty() {
            debug!(context_id, cancelled = removed.len(), "cancelled outstanding timers");
        }
        for record in &removed {
            self.shared.event_loop.cancel(record.id);
        }
        if let Some(worker) = self.contexts.iter().find(|c| c.state.id() == context_id) {
            worker.state.clear_timers();
        }
    }

    /// Detach the context from the runtime, destroy it and fire its
    /// completion callback.
    fn free_context(&mut self, context_id: u32) {
        let Some(index) = self
            .contexts
            .iter()
            .position(|c| c.state.id() == context_id)
        else {
            return;
        };
        let worker = self.contexts.swap_remove(index);
        {
            let mut counters = self.shared.counters.lock();
            counters.context_count = counters.context_count.saturating_sub(1);
        }
        debug!(context_id, "context freed");
        worker.finish();
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        // Tear down every live context. Outstanding timers are cancelled
        // first so each completion callback still fires exactly once.
        let ids: Vec<u32> = self.contexts.iter().map(|c| c.state.id()).collect();
        for id in ids {
            self.cancel_context_timers(id);
            if let Some(worker) = self.contexts.iter().find(|c| c.state.id() == id) {
                worker.state.mark_pending_free();
            }
            self.free_context(id);
        }

        let residual = self.shared.timer_table.live_timers();
        if residual > 0 {
            warn!(residual, "timer table not empty after teardown; detaching entries");
            drop(self.shared.timer_table.take_all());
        }
        self.shared.event_loop.clear();
    }
}
