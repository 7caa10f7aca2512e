//! Short-lived evaluation contexts.
//!
//! A `WorkerContext` wraps exactly one engine context for one task. It is
//! created by the runtime, handed a completion callback, and destroyed as
//! soon as it is idle: either straight after evaluation when no timers were
//! registered, or from the timer-close path once the last timer is gone.

use std::cell::Cell;

use boa_engine::Context;
use tracing::warn;

/// Fires exactly once, after the context has been destroyed.
pub type CompletionCallback = Box<dyn FnOnce()>;

/// State shared between a live context and the timers it registered.
///
/// `pending_free` is a one-way latch: once set, no further work may be
/// submitted against the context and it is destroyed as soon as
/// `active_timers` reaches zero.
pub(crate) struct ContextState {
    id: u32,
    active_timers: Cell<u32>,
    pending_free: Cell<bool>,
}

impl ContextState {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            active_timers: Cell::new(0),
            pending_free: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn active_timers(&self) -> u32 {
        self.active_timers.get()
    }

    pub(crate) fn add_timer(&self) {
        self.active_timers.set(self.active_timers.get() + 1);
    }

    pub(crate) fn release_timer(&self) {
        self.active_timers
            .set(self.active_timers.get().saturating_sub(1));
    }

    pub(crate) fn clear_timers(&self) {
        self.active_timers.set(0);
    }

    pub(crate) fn mark_pending_free(&self) {
        self.pending_free.set(true);
    }

    pub(crate) fn pending_free(&self) -> bool {
        self.pending_free.get()
    }

    pub(crate) fn ready_to_free(&self) -> bool {
        self.active_timers.get() == 0 && self.pending_free.get()
    }
}

pub(crate) struct WorkerContext {
    pub(crate) context: Context,
    pub(crate) state: std::rc::Rc<ContextState>,
    on_done: Option<CompletionCallback>,
}

impl WorkerContext {
    pub(crate) fn new(context: Context, state: std::rc::Rc<ContextState>) -> Self {
        Self {
            context,
            state,
            on_done: None,
        }
    }

    pub(crate) fn set_on_done(&mut self, on_done: CompletionCallback) {
        self.on_done = Some(on_done);
    }

    /// Run the engine's queued jobs. Failures here are asynchronous from the
    /// submitter's point of view, so they are logged and swallowed.
    pub(crate) fn drain_microtasks(&mut self) {
        if let Err(err) = self.context.run_jobs() {
            warn!(context_id = self.state.id(), "microtask failed: {err}");
        }
    }

    /// Destroy the context, then invoke the completion callback.
    pub(crate) fn finish(mut self) {
        let on_done = self.on_done.take();
        drop(self);
        if let Some(on_done) = on_done {
            on_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ContextState;

    #[test]
    fn pending_free_is_a_one_way_latch() {
        let state = ContextState::new(1);
        assert!(!state.pending_free());
        state.mark_pending_free();
        assert!(state.pending_free());
        assert!(state.ready_to_free());
    }

    #[test]
    fn timer_accounting_never_goes_negative() {
        let state = ContextState::new(1);
        state.add_timer();
        state.add_timer();
        assert_eq!(state.active_timers(), 2);
        state.release_timer();
        state.release_timer();
        state.release_timer();
        assert_eq!(state.active_timers(), 0);
        assert!(!state.ready_to_free());
    }
}
