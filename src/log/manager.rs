#![forbid(unsafe_code)]
//! Pool of preallocated physical logs.
//!
//! The pool lives in one durable segment: a page-aligned array of 32-byte
//! metadata blocks followed by the page-aligned rings. Metadata block `i`
//! belongs to ring `i`. Word 0 of every block holds the slot's type tag in
//! its low 16 bits plus generic flags above, so a restarted process can tell
//! which slots hold data of which log type.
//!
//! Slots move between three lists guarded by one mutex:
//!
//! * `free`: available to [`LogManager::alloc_log`], possibly still bound to
//!   an instance of their previous type,
//! * `pending`: found with a type tag at [`LogManager::init`], waiting for
//!   recovery,
//! * `active`: handed out.
//!
//! Log types plug in through [`LogOps`] and [`ManagedLog`].

use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use tracing::debug;

use super::phlog::{LogSlot, PhlogStats, NVMD_BYTES, NVMD_GENERIC_FLAGS};
use super::truncation::{self, TruncationSignal};
use crate::pcm::{PcmContext, Storeset};
use crate::primitives::region::{Segment, PAGE_SIZE};
use crate::types::{LogOrder, LogType, MnemoError, PAddr, Result};

/// Bits of the generic flags word holding the type tag.
pub const TYPE_MASK: u64 = 0xFFFF;

/// Generic flag: the slot is truncated by the background thread.
pub const ASYNC_TRUNCATION: u64 = 1 << 16;

/// Segment flags identifying the log pool in the region directory.
pub const LOG_POOL_FLAGS: u64 = 0x4c4f_4750;

/// Factory for one log type.
pub trait LogOps: Send + Sync {
    /// Binds an instance of this type to `slot` without touching its
    /// contents, so pending data can still be recovered.
    fn alloc(&self, set: &mut Storeset, slot: LogSlot) -> Result<Arc<dyn ManagedLog>>;
}

/// A log instance as seen by the manager.
///
/// The order-returning hooks report [`LogOrder::INVALID`] once nothing is
/// left; across logs the manager always runs the lowest order first.
pub trait ManagedLog: Send + Sync {
    /// Prepares the slot for a new owner, discarding old contents.
    fn init(&self, set: &mut Storeset) -> Result<()>;

    /// Whether the truncation hooks do anything.
    fn supports_truncation(&self) -> bool {
        false
    }

    /// Starts a truncation pass. Called for every log of the pass while
    /// appends are held off, so it should only capture cursors.
    fn truncation_init(&self, _set: &mut Storeset) -> Result<()> {
        Ok(())
    }

    /// Finds the next truncatable unit.
    fn truncation_prepare_next(&self, _set: &mut Storeset) -> Result<LogOrder> {
        Ok(LogOrder::INVALID)
    }

    /// Truncates the unit found by the last prepare.
    fn truncation_do(&self, _set: &mut Storeset) -> Result<()> {
        Ok(())
    }

    /// Whether the recovery hooks do anything.
    fn supports_recovery(&self) -> bool {
        false
    }

    /// Rebuilds volatile state from the slot after a restart.
    fn recovery_init(&self, _set: &mut Storeset) -> Result<()> {
        Ok(())
    }

    /// Finds the next unit to replay.
    fn recovery_prepare_next(&self, _set: &mut Storeset) -> Result<LogOrder> {
        Ok(LogOrder::INVALID)
    }

    /// Replays the unit found by the last prepare.
    fn recovery_do(&self, _set: &mut Storeset) -> Result<()> {
        Ok(())
    }

    /// Cursor snapshot of the underlying ring.
    fn report_stats(&self) -> PhlogStats;

    /// Upcast used by [`LogHandle::downcast`].
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// An allocated log.
#[derive(Clone)]
pub struct LogHandle {
    index: usize,
    log_type: LogType,
    flags: u64,
    log: Arc<dyn ManagedLog>,
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("index", &self.index)
            .field("log_type", &self.log_type)
            .field("flags", &format_args!("{:#x}", self.flags))
            .finish()
    }
}

impl LogHandle {
    /// Pool slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Type tag the slot was allocated with.
    pub fn log_type(&self) -> LogType {
        self.log_type
    }

    /// True when the background thread truncates this log.
    pub fn is_async(&self) -> bool {
        self.flags & ASYNC_TRUNCATION != 0
    }

    /// The bound instance.
    pub fn log(&self) -> &Arc<dyn ManagedLog> {
        &self.log
    }

    /// The bound instance as its concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.log).as_any().downcast::<T>().ok()
    }
}

/// Counters reported by [`LogManager::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ManagerStats {
    /// Slots in the pool.
    pub slots: usize,
    /// Slots on the free list.
    pub free: usize,
    /// Slots waiting for recovery.
    pub pending: usize,
    /// Slots handed out.
    pub active: usize,
    /// Completed truncation passes.
    pub truncation_passes: u64,
    /// Units truncated over all passes.
    pub truncated_units: u64,
    /// Units replayed by recovery.
    pub recovered_units: u64,
}

pub(crate) struct SlotEntry {
    pub(crate) slot: LogSlot,
    pub(crate) log_type: LogType,
    pub(crate) flags: u64,
    pub(crate) log: Option<Arc<dyn ManagedLog>>,
}

pub(crate) struct ManagerState {
    pub(crate) slots: Vec<SlotEntry>,
    pub(crate) free: Vec<usize>,
    pub(crate) pending: Vec<usize>,
    pub(crate) active: Vec<usize>,
    pub(crate) known: FxHashMap<LogType, Arc<dyn LogOps>>,
    pub(crate) truncation_passes: u64,
    pub(crate) truncated_units: u64,
    pub(crate) recovered_units: u64,
}

pub(crate) struct ManagerInner {
    pub(crate) ctx: Arc<PcmContext>,
    pub(crate) state: Mutex<ManagerState>,
    /// Held shared while a record is appended, exclusively while a
    /// truncation pass captures the extent of every log.
    pub(crate) cut: RwLock<()>,
    pub(crate) signal: Mutex<TruncationSignal>,
    pub(crate) wakeup: Condvar,
    pub(crate) done: Condvar,
}

/// Owner of the log pool and of the background truncation thread.
pub struct LogManager {
    inner: Arc<ManagerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("stats", &self.stats())
            .finish()
    }
}

struct PoolLayout {
    slots: usize,
    words: u64,
    meta_bytes: u64,
    log_bytes: u64,
}

impl PoolLayout {
    fn new(slots: usize, words: u64) -> Self {
        Self {
            slots,
            words,
            meta_bytes: round_to_page(slots as u64 * NVMD_BYTES),
            log_bytes: round_to_page(words * 8),
        }
    }

    fn total(&self) -> u64 {
        self.meta_bytes + self.slots as u64 * self.log_bytes
    }

    fn slot(&self, base: PAddr, index: usize) -> LogSlot {
        LogSlot {
            index,
            nvmd: base.add(index as u64 * NVMD_BYTES),
            data: base.add(self.meta_bytes + index as u64 * self.log_bytes),
            words: self.words,
        }
    }
}

fn round_to_page(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

impl LogManager {
    /// Finds the log pool in the region directory, creating it on first use,
    /// and sorts its slots by their persisted type tags.
    pub fn init(set: &mut Storeset) -> Result<Arc<Self>> {
        let ctx = Arc::clone(set.context());
        let config = ctx.config();
        if config.log_pool_slots == 0 {
            return Err(MnemoError::Invalid("log pool needs at least one slot"));
        }
        let layout = PoolLayout::new(config.log_pool_slots as usize, config.log_slot_words);
        let region = ctx.region();
        let pool = match region.find_region(PAddr(PAGE_SIZE))? {
            Some(seg) => Self::check_pool(seg, &layout)?,
            None => region.alloc_region(Some(PAddr(PAGE_SIZE)), layout.total(), LOG_POOL_FLAGS)?,
        };

        let mut state = ManagerState {
            slots: Vec::with_capacity(layout.slots),
            free: Vec::new(),
            pending: Vec::new(),
            active: Vec::new(),
            known: FxHashMap::default(),
            truncation_passes: 0,
            truncated_units: 0,
            recovered_units: 0,
        };
        for index in 0..layout.slots {
            let slot = layout.slot(pool.start, index);
            slot.validate()?;
            let generic = region.load(slot.nvmd_word(NVMD_GENERIC_FLAGS))?;
            let log_type = LogType((generic & TYPE_MASK) as u16);
            if log_type == LogType::FREE {
                state.free.push(index);
            } else {
                state.pending.push(index);
            }
            state.slots.push(SlotEntry {
                slot,
                log_type,
                flags: generic & !TYPE_MASK,
                log: None,
            });
        }
        debug!(
            pool = pool.start.0,
            slots = layout.slots,
            free = state.free.len(),
            pending = state.pending.len(),
            "logmgr.init"
        );

        Ok(Arc::new(Self {
            inner: Arc::new(ManagerInner {
                ctx,
                state: Mutex::new(state),
                cut: RwLock::new(()),
                signal: Mutex::new(TruncationSignal::default()),
                wakeup: Condvar::new(),
                done: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }))
    }

    fn check_pool(seg: Segment, layout: &PoolLayout) -> Result<Segment> {
        if seg.flags != LOG_POOL_FLAGS {
            return Err(MnemoError::Corruption("unexpected segment at log pool address"));
        }
        if seg.len < layout.total() {
            return Err(MnemoError::Corruption("log pool smaller than configured"));
        }
        Ok(seg)
    }

    /// The emulation context the pool lives in.
    pub fn context(&self) -> &Arc<PcmContext> {
        &self.inner.ctx
    }

    /// Registers a log type. Pending slots tagged with it are bound to new
    /// instances, ready for [`LogManager::do_recovery`]. Registering a type
    /// twice keeps the first factory.
    pub fn register_logtype(
        &self,
        set: &mut Storeset,
        log_type: LogType,
        ops: Arc<dyn LogOps>,
    ) -> Result<()> {
        if log_type == LogType::FREE || u64::from(log_type.0) > TYPE_MASK {
            return Err(MnemoError::Invalid("log type tag is reserved"));
        }
        let mut state = self.inner.state.lock();
        if state.known.contains_key(&log_type) {
            return Ok(());
        }
        state.known.insert(log_type, Arc::clone(&ops));
        let pending = state.pending.clone();
        let mut bound = 0usize;
        for index in pending {
            let entry = &mut state.slots[index];
            if entry.log_type == log_type && entry.log.is_none() {
                entry.log = Some(ops.alloc(set, entry.slot)?);
                bound += 1;
            }
        }
        debug!(log_type = log_type.0, bound, "logmgr.register_logtype");
        Ok(())
    }

    /// Hands out a log of `log_type`. Prefers a free slot still bound to
    /// that type, then an untagged slot, then any free slot.
    pub fn alloc_log(
        &self,
        set: &mut Storeset,
        log_type: LogType,
        flags: u64,
    ) -> Result<LogHandle> {
        let mut state = self.inner.state.lock();
        let ops = state
            .known
            .get(&log_type)
            .cloned()
            .ok_or(MnemoError::Invalid("log type not registered"))?;
        let reuse = state.free.iter().position(|&i| {
            let entry = &state.slots[i];
            entry.log_type == log_type && entry.log.is_some()
        });
        let pick = reuse
            .or_else(|| {
                state
                    .free
                    .iter()
                    .position(|&i| state.slots[i].log_type == LogType::FREE)
            })
            .or(if state.free.is_empty() { None } else { Some(0) })
            .ok_or(MnemoError::Invalid("no free log slot"))?;
        let index = state.free[pick];

        let log = {
            let entry = &mut state.slots[index];
            let bound = if reuse.is_some() { entry.log.clone() } else { None };
            let log = match bound {
                Some(log) => log,
                None => {
                    let log = ops.alloc(set, entry.slot)?;
                    entry.log = Some(Arc::clone(&log));
                    log
                }
            };
            log.init(set)?;
            let flags = flags & !TYPE_MASK;
            set.nt_store(
                entry.slot.nvmd_word(NVMD_GENERIC_FLAGS),
                u64::from(log_type.0) | flags,
            )?;
            set.nt_flush()?;
            entry.log_type = log_type;
            entry.flags = flags;
            log
        };
        state.free.swap_remove(pick);
        state.active.push(index);
        let flags = state.slots[index].flags;
        debug!(
            slot = index,
            log_type = log_type.0,
            reused = reuse.is_some(),
            "logmgr.alloc_log"
        );
        Ok(LogHandle {
            index,
            log_type,
            flags,
            log,
        })
    }

    /// Returns a log to the free list. Logs truncated in the background are
    /// put through a full truncation pass first, so nothing they hold can be
    /// replayed over newer data after a restart.
    pub fn free_log(&self, set: &mut Storeset, handle: &LogHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(pos) = state.active.iter().position(|&i| i == handle.index) else {
            return Err(MnemoError::Invalid("log slot is not active"));
        };
        if handle.is_async() {
            truncation::run_pass(&self.inner, &mut state, set)?;
        }
        state.active.swap_remove(pos);
        state.free.push(handle.index);
        debug!(slot = handle.index, "logmgr.free_log");
        Ok(())
    }

    /// Replays every pending slot whose type is registered, lowest order
    /// first across all of them, then moves those slots to the free list.
    /// Returns the number of units replayed.
    pub fn do_recovery(&self, set: &mut Storeset) -> Result<u64> {
        let mut state = self.inner.state.lock();
        let mut indices = Vec::new();
        let mut logs = Vec::new();
        for &index in &state.pending {
            if let Some(log) = &state.slots[index].log {
                indices.push(index);
                logs.push(Arc::clone(log));
            }
        }
        let mut orders = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.supports_recovery() {
                log.recovery_init(set)?;
                orders.push(log.recovery_prepare_next(set)?);
            } else {
                orders.push(LogOrder::INVALID);
            }
        }
        let mut replayed = 0u64;
        while let Some(i) = lowest_order(&orders) {
            logs[i].recovery_do(set)?;
            replayed += 1;
            orders[i] = logs[i].recovery_prepare_next(set)?;
        }
        state.pending.retain(|index| !indices.contains(index));
        state.free.extend(indices.iter().copied());
        state.recovered_units += replayed;
        debug!(logs = logs.len(), replayed, "logmgr.recovery");
        Ok(replayed)
    }

    /// Runs one truncation pass with the caller's storeset.
    pub fn truncate_now(&self, set: &mut Storeset) -> Result<u64> {
        let mut state = self.inner.state.lock();
        truncation::run_pass(&self.inner, &mut state, set)
    }

    /// Starts the background truncation thread. A second call is a no-op.
    pub fn start_truncation(&self, interval: Duration) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.inner.signal.lock().shutdown = false;
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("mnemo-truncation".into())
            .spawn(move || truncation::worker_loop(inner, interval))?;
        *worker = Some(handle);
        debug!(interval_ms = interval.as_millis() as u64, "logmgr.truncation.start");
        Ok(())
    }

    /// Whether the background thread is running.
    pub fn truncation_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Asks the background thread for a pass and waits up to `timeout` for
    /// it. Without a thread the pass runs inline on `set`. Returns false on
    /// timeout or shutdown.
    pub fn request_truncation_and_wait(
        &self,
        set: &mut Storeset,
        timeout: Duration,
    ) -> Result<bool> {
        if !self.truncation_running() {
            self.truncate_now(set)?;
            return Ok(true);
        }
        Ok(truncation::request_and_wait(&self.inner, timeout))
    }

    /// Stops and joins the background thread.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            {
                let mut signal = self.inner.signal.lock();
                signal.shutdown = true;
                self.inner.wakeup.notify_all();
                self.inner.done.notify_all();
            }
            if handle.join().is_err() {
                tracing::warn!("logmgr.truncation.panicked");
            }
            debug!("logmgr.truncation.stopped");
        }
    }

    /// Shared guard appenders hold while making a record durable, so a
    /// truncation pass sees a consistent cut across logs.
    pub fn append_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.cut.read()
    }

    /// List sizes and pass counters.
    pub fn stats(&self) -> ManagerStats {
        let state = self.inner.state.lock();
        ManagerStats {
            slots: state.slots.len(),
            free: state.free.len(),
            pending: state.pending.len(),
            active: state.active.len(),
            truncation_passes: state.truncation_passes,
            truncated_units: state.truncated_units,
            recovered_units: state.recovered_units,
        }
    }

    /// Cursor snapshots of every bound slot.
    pub fn log_stats(&self) -> Vec<(usize, LogType, PhlogStats)> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter_map(|entry| {
                entry
                    .log
                    .as_ref()
                    .map(|log| (entry.slot.index, entry.log_type, log.report_stats()))
            })
            .collect()
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Position of the smallest valid order.
pub(crate) fn lowest_order(orders: &[LogOrder]) -> Option<usize> {
    orders
        .iter()
        .enumerate()
        .filter(|(_, order)| order.is_valid())
        .min_by_key(|(_, order)| **order)
        .map(|(i, _)| i)
}
