#![forbid(unsafe_code)]
//! Background truncation.
//!
//! A pass captures the durable extent of every asynchronously truncated log
//! while appends are held off, then truncates units lowest order first, the
//! same selection recovery uses. Each pass builds its own storeset so the
//! idle thread never shows up in the crash coordinator's registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::manager::{lowest_order, ManagerInner, ManagerState, ASYNC_TRUNCATION};
use crate::pcm::Storeset;
use crate::types::Result;

/// Requests and completions exchanged with the worker.
#[derive(Debug, Default)]
pub(crate) struct TruncationSignal {
    pub(crate) requested: u64,
    pub(crate) completed: u64,
    pub(crate) shutdown: bool,
}

/// Truncates everything truncatable in the active asynchronous logs.
pub(crate) fn run_pass(
    inner: &ManagerInner,
    state: &mut ManagerState,
    set: &mut Storeset,
) -> Result<u64> {
    let logs: Vec<_> = state
        .active
        .iter()
        .filter_map(|&index| {
            let entry = &state.slots[index];
            match &entry.log {
                Some(log) if entry.flags & ASYNC_TRUNCATION != 0 && log.supports_truncation() => {
                    Some(Arc::clone(log))
                }
                _ => None,
            }
        })
        .collect();
    {
        let _cut = inner.cut.write();
        for log in &logs {
            log.truncation_init(set)?;
        }
    }
    let mut orders = Vec::with_capacity(logs.len());
    for log in &logs {
        orders.push(log.truncation_prepare_next(set)?);
    }
    let mut truncated = 0u64;
    while let Some(i) = lowest_order(&orders) {
        logs[i].truncation_do(set)?;
        truncated += 1;
        orders[i] = logs[i].truncation_prepare_next(set)?;
    }
    state.truncation_passes += 1;
    state.truncated_units += truncated;
    debug!(logs = logs.len(), truncated, "logmgr.truncation.pass");
    Ok(truncated)
}

pub(crate) fn worker_loop(inner: Arc<ManagerInner>, interval: Duration) {
    loop {
        let target = {
            let mut signal = inner.signal.lock();
            if !signal.shutdown && signal.requested == signal.completed {
                inner.wakeup.wait_for(&mut signal, interval);
            }
            if signal.shutdown {
                debug!("logmgr.truncation.worker_exit");
                break;
            }
            signal.requested
        };
        let result = {
            let mut set = Storeset::new(&inner.ctx);
            let mut state = inner.state.lock();
            run_pass(&inner, &mut state, &mut set)
        };
        if let Err(err) = result {
            warn!(error = %err, "logmgr.truncation.failed");
        }
        let mut signal = inner.signal.lock();
        signal.completed = signal.completed.max(target);
        inner.done.notify_all();
    }
}

/// Signals the worker and waits for a pass that started after the signal.
pub(crate) fn request_and_wait(inner: &ManagerInner, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut signal = inner.signal.lock();
    signal.requested += 1;
    let target = signal.requested;
    inner.wakeup.notify_all();
    while signal.completed < target {
        if signal.shutdown || inner.done.wait_until(&mut signal, deadline).timed_out() {
            debug!(target, "logmgr.truncation.wait_gave_up");
            return false;
        }
    }
    true
}
