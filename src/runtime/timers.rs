//! Timer Table and the timer built-ins installed into every context.
//!
//! `setTimeout`/`setInterval` allocate a runtime-wide id, retain the JS
//! callback inside a [`TimerRecord`] and schedule the fire on the event
//! loop. `clearTimeout`/`clearInterval` remove the record immediately
//! (releasing the retained callback) and defer the owning context's
//! `active_timers` release to the next loop tick, so a context can never be
//! destroyed from inside its own JS frame.
//!
//! The built-ins recover the owning context through typed closure captures
//! rather than a script-visible global, so user code cannot sever the link.

use std::{rc::Rc, time::Duration};

use boa_engine::{Context, JsNativeError, JsObject, JsResult, JsValue, NativeFunction, js_string};
use boa_gc::{Finalize, Trace};
use parking_lot::Mutex;

use super::{RuntimeShared, context::ContextState};

pub(crate) const TIMER_TABLE_BUCKETS: usize = 64;

/// Bookkeeping for one live timer. Owns the retained JS callback until the
/// close path releases it.
pub(crate) struct TimerRecord {
    pub(crate) id: u32,
    pub(crate) state: Rc<ContextState>,
    pub(crate) callback: JsObject,
    pub(crate) interval: bool,
    pub(crate) delay: Duration,
}

/// Keyed lookup of live timers: fixed bucket count, one mutex for the whole
/// table, independent from the runtime counters lock.
pub(crate) struct TimerTable {
    buckets: Mutex<[Vec<TimerRecord>; TIMER_TABLE_BUCKETS]>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            buckets: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    fn bucket(id: u32) -> usize {
        id as usize % TIMER_TABLE_BUCKETS
    }

    pub(crate) fn insert(&self, record: TimerRecord) {
        self.buckets.lock()[Self::bucket(record.id)].push(record);
    }

    /// Remove and return the record for `id`. Idempotent: a second call for
    /// the same id is a no-op.
    pub(crate) fn take(&self, id: u32) -> Option<TimerRecord> {
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[Self::bucket(id)];
        let position = bucket.iter().position(|record| record.id == id)?;
        Some(bucket.swap_remove(position))
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.buckets.lock()[Self::bucket(id)]
            .iter()
            .any(|record| record.id == id)
    }

    /// Clone out what the fire path needs so no table lock is held while the
    /// callback runs.
    pub(crate) fn fire_info(&self, id: u32) -> Option<(JsObject, bool, Duration, Rc<ContextState>)> {
        let buckets = self.buckets.lock();
        buckets[Self::bucket(id)]
            .iter()
            .find(|record| record.id == id)
            .map(|record| {
                (
                    record.callback.clone(),
                    record.interval,
                    record.delay,
                    record.state.clone(),
                )
            })
    }

    /// Remove every timer owned by the given context.
    pub(crate) fn take_for_context(&self, context_id: u32) -> Vec<TimerRecord> {
        let mut buckets = self.buckets.lock();
        let mut removed = Vec::new();
        for bucket in buckets.iter_mut() {
            let mut index = 0;
            while index < bucket.len() {
                if bucket[index].state.id() == context_id {
                    removed.push(bucket.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }
        removed
    }

    /// Remove every record. Teardown path.
    pub(crate) fn take_all(&self) -> Vec<TimerRecord> {
        let mut buckets = self.buckets.lock();
        let mut removed = Vec::new();
        for bucket in buckets.iter_mut() {
            removed.append(bucket);
        }
        removed
    }

    pub(crate) fn live_timers(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }
}

/// Typed per-context slot handed to the timer built-ins; recovers the owning
/// context state and the runtime internals from any engine-callback frame.
#[derive(Clone, Trace, Finalize)]
struct TimerHost {
    #[unsafe_ignore_trace]
    state: Rc<ContextState>,
    #[unsafe_ignore_trace]
    shared: Rc<RuntimeShared>,
}

pub(crate) fn install_timer_builtins(
    context: &mut Context,
    state: Rc<ContextState>,
    shared: Rc<RuntimeShared>,
) -> JsResult<()> {
    let host = TimerHost { state, shared };

    context.register_global_callable(
        js_string!("setTimeout"),
        2,
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host, context| start_timer(args, false, host, context),
            host.clone(),
        ),
    )?;
    context.register_global_callable(
        js_string!("setInterval"),
        2,
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host, context| start_timer(args, true, host, context),
            host.clone(),
        ),
    )?;
    context.register_global_callable(
        js_string!("clearTimeout"),
        1,
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host, context| clear_timer(args, host, context),
            host.clone(),
        ),
    )?;
    context.register_global_callable(
        js_string!("clearInterval"),
        1,
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host, context| clear_timer(args, host, context),
            host,
        ),
    )?;

    Ok(())
}

fn start_timer(
    args: &[JsValue],
    interval: bool,
    host: &TimerHost,
    context: &mut Context,
) -> JsResult<JsValue> {
    let callback = match args.first().and_then(|value| value.as_object()) {
        Some(object) if object.is_callable() => object.clone(),
        _ => {
            let name = if interval { "setInterval" } else { "setTimeout" };
            return Err(JsNativeError::typ()
                .with_message(format!("{name} requires a callback function"))
                .into());
        }
    };
    let delay_ms = match args.get(1) {
        Some(value) => value.to_i32(context)?,
        None => 0,
    };
    // Negative delays clamp to zero and fire on the next tick.
    let delay = Duration::from_millis(delay_ms.max(0) as u64);

    let id = host.shared.next_timer_id();
    host.shared.timer_table.insert(TimerRecord {
        id,
        state: host.state.clone(),
        callback,
        interval,
        delay,
    });
    host.shared.event_loop.schedule(id, delay);
    host.state.add_timer();

    Ok(JsValue::from(id))
}

fn clear_timer(args: &[JsValue], host: &TimerHost, context: &mut Context) -> JsResult<JsValue> {
    let Some(value) = args.first() else {
        return Ok(JsValue::undefined());
    };
    let id = value.to_u32(context)?;
    if let Some(record) = host.shared.timer_table.take(id) {
        // The retained callback drops with the record; the active-timer
        // release happens on the next tick, outside this JS frame.
        host.shared.event_loop.cancel(id);
        host.shared.event_loop.defer_release(record.state.clone());
    }
    Ok(JsValue::undefined())
}
