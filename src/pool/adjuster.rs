//! Dynamic pool sizing.
//!
//! The adjuster sleeps on the pool's idle condition and reacts to the
//! idle/backlog balance: too many idle workers shrinks the pool by one, a
//! backlog with no idle worker grows it by one. A one-second pause between
//! decisions damps oscillation.

use std::{
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{info, warn};

use super::{PoolCore, PoolError};

const DAMPING: Duration = Duration::from_secs(1);

pub(crate) fn spawn(core: &Arc<PoolCore>) -> Result<JoinHandle<()>, PoolError> {
    let core = Arc::clone(core);
    thread::Builder::new()
        .name("krait-adjuster".into())
        .spawn(move || adjuster_main(core))
        .map_err(PoolError::Spawn)
}

fn adjuster_main(core: Arc<PoolCore>) {
    info!("pool adjuster started");

    while core.adjuster_running.load(Ordering::SeqCst) {
        {
            // Re-check the running flag under the lock: shutdown clears it
            // before signalling, so the wake-up cannot be lost.
            let mut guard = core.idle_lock.lock();
            if !core.adjuster_running.load(Ordering::SeqCst) {
                break;
            }
            core.idle_cond.wait(&mut guard);
        }
        if !core.adjuster_running.load(Ordering::SeqCst) {
            break;
        }
        if !core.config.dynamic_sizing {
            continue;
        }

        let idle = core.idle_threads.load(Ordering::SeqCst);
        let count = core.workers.read().len();

        if idle > core.config.idle_threshold && count > 1 {
            info!(from = count, to = count - 1, "idle threshold exceeded; shrinking pool");
            if let Err(err) = core.resize(count - 1) {
                warn!("failed to shrink pool: {err}");
            }
        }

        if idle == 0 && core.queue.len() > 0 {
            info!(from = count, to = count + 1, "backlog with no idle workers; growing pool");
            if let Err(err) = core.resize(count + 1) {
                warn!("failed to grow pool: {err}");
            }
        }

        thread::sleep(DAMPING);
    }

    info!("pool adjuster exiting");
}
