//! Per-runtime event loop: a deadline-ordered heap of scheduled timer fires
//! plus the deferred-release list for timers cancelled from inside JS.
//!
//! The loop itself never blocks. `WorkerRuntime::run_loop_once` drains the
//! due entries and decides what happens to each timer; this module only does
//! the bookkeeping.

use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

use super::context::ContextState;

/// A scheduled fire in the deadline heap.
struct TimerEntry {
    /// When this timer should fire.
    deadline: Instant,
    /// Timer Table key; the entry is stale if the key is no longer present.
    timer_id: u32,
    /// Tiebreaker so same-deadline timers fire in scheduling order.
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct EventLoop {
    timers: RefCell<BinaryHeap<TimerEntry>>,
    /// Contexts owed an `active_timers` release from a cancelled timer.
    /// Processed at the top of the next tick, outside any JS frame.
    released: RefCell<Vec<Rc<ContextState>>>,
    seq: Cell<u64>,
}

impl EventLoop {
    pub(crate) fn new() -> Self {
        Self {
            timers: RefCell::new(BinaryHeap::with_capacity(32)),
            released: RefCell::new(Vec::new()),
            seq: Cell::new(0),
        }
    }

    pub(crate) fn schedule(&self, timer_id: u32, delay: Duration) {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + delay,
            timer_id,
            seq,
        });
    }

    /// Drop the scheduled fire for a cancelled timer so it no longer counts
    /// as pending work.
    pub(crate) fn cancel(&self, timer_id: u32) {
        self.timers
            .borrow_mut()
            .retain(|entry| entry.timer_id != timer_id);
    }

    pub(crate) fn defer_release(&self, state: Rc<ContextState>) {
        self.released.borrow_mut().push(state);
    }

    pub(crate) fn take_released(&self) -> Vec<Rc<ContextState>> {
        self.released.take()
    }

    /// Pop every entry whose deadline has passed, earliest first.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<u32> {
        let mut due = Vec::new();
        let mut timers = self.timers.borrow_mut();
        loop {
            let is_due = timers
                .peek()
                .map(|entry| entry.deadline <= now)
                .unwrap_or(false);
            if !is_due {
                break;
            }
            if let Some(entry) = timers.pop() {
                due.push(entry.timer_id);
            }
        }
        due
    }

    /// Time until the next scheduled fire, for polite sleeping between ticks.
    pub(crate) fn time_until_next_timer(&self) -> Option<Duration> {
        self.timers.borrow().peek().map(|entry| {
            let now = Instant::now();
            if entry.deadline > now {
                entry.deadline - now
            } else {
                Duration::ZERO
            }
        })
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.timers.borrow().is_empty() || !self.released.borrow().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.timers.borrow_mut().clear();
        self.released.borrow_mut().clear();
    }
}
