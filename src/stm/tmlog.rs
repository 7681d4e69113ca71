#![forbid(unsafe_code)]
//! Redo log of the transactional memory.
//!
//! A record is a run of `(addr, value, mask)` triples followed by a marker
//! pair and padded to the end of its chunk:
//!
//! ```text
//! addr value mask ... addr value mask COMMIT sqn | pad
//! addr value mask ... ABORT 0                    | pad
//! ```
//!
//! Records are appended at commit time, once the write set is final, and
//! made durable before any value is installed. Recovery replays committed
//! records in commit order across all logs; truncation writes back the lines
//! a record touched and then drops it.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::config::LogKind;
use crate::log::phlog::{BaseLog, LogSlot, PhlogStats, PhysicalLog, TornbitLog};
use crate::log::{LogOps, ManagedLog};
use crate::pcm::Storeset;
use crate::types::{LogOrder, LogType, MnemoError, PAddr, Result};

/// Type tag of transactional logs over [`BaseLog`].
pub const TM_BASE_LOG: LogType = LogType(1);

/// Type tag of transactional logs over [`TornbitLog`].
pub const TM_TORNBIT_LOG: LogType = LogType(2);

/// First word of a commit marker; the commit sequence number follows.
pub const COMMIT_MARKER: u64 = 0x0010_0000_0000_0000;

/// First word of an abort marker; a zero word follows.
pub const ABORT_MARKER: u64 = 0x0100_0000_0000_0000;

/// Log tag used for the given encoding.
pub fn log_type_for(kind: LogKind) -> LogType {
    match kind {
        LogKind::Base => TM_BASE_LOG,
        LogKind::Tornbit => TM_TORNBIT_LOG,
    }
}

/// One logged write.
pub type RedoEntry = (PAddr, u64, u64);

/// Factory registered with the log manager.
#[derive(Clone, Copy, Debug)]
pub struct TmLogOps {
    kind: LogKind,
}

impl TmLogOps {
    /// Factory for logs of the given encoding.
    pub fn new(kind: LogKind) -> Self {
        Self { kind }
    }
}

impl LogOps for TmLogOps {
    fn alloc(&self, set: &mut Storeset, slot: LogSlot) -> Result<Arc<dyn ManagedLog>> {
        let log = open_physical(self.kind, set, slot)?;
        Ok(Arc::new(TmLog {
            kind: self.kind,
            slot,
            line_log: set.context().config().cacheline_size_log,
            inner: Mutex::new(TmLogInner {
                log,
                open_words: 0,
                limit: 0,
                blocks: FxHashSet::default(),
                replay: Vec::new(),
                commits: 0,
                aborts: 0,
            }),
        }))
    }
}

fn open_physical(kind: LogKind, set: &Storeset, slot: LogSlot) -> Result<Box<dyn PhysicalLog>> {
    Ok(match kind {
        LogKind::Base => Box::new(BaseLog::open(set, slot)?),
        LogKind::Tornbit => Box::new(TornbitLog::open(set, slot)?),
    })
}

/// Transactional redo log bound to one pool slot.
pub struct TmLog {
    kind: LogKind,
    slot: LogSlot,
    line_log: u32,
    inner: Mutex<TmLogInner>,
}

impl std::fmt::Debug for TmLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmLog")
            .field("kind", &self.kind)
            .field("slot", &self.slot.index)
            .finish()
    }
}

pub(crate) struct TmLogInner {
    log: Box<dyn PhysicalLog>,
    open_words: u64,
    limit: u64,
    blocks: FxHashSet<u64>,
    replay: Vec<RedoEntry>,
    commits: u64,
    aborts: u64,
}

/// Exclusive access to a [`TmLog`] for appending.
///
/// Committers keep it from the moment the record is durable until every
/// lock of the transaction is released, so truncation never sees a record
/// whose values are still being installed.
pub struct TmLogWriter<'a> {
    guard: MutexGuard<'a, TmLogInner>,
}

impl TmLogWriter<'_> {
    fn write(&mut self, set: &mut Storeset, word: u64) -> Result<()> {
        self.guard.log.write(set, word)?;
        self.guard.open_words += 1;
        Ok(())
    }

    /// Appends the record `entries` + commit marker and makes it durable.
    ///
    /// On [`MnemoError::LogFull`] the partial record is discarded and the
    /// log is left as it was before the call.
    pub fn append_commit(
        &mut self,
        set: &mut Storeset,
        entries: &[RedoEntry],
        sqn: u64,
    ) -> Result<()> {
        let result = self.append(set, entries, sqn);
        if matches!(result, Err(MnemoError::LogFull)) {
            self.guard.log.rewind_writer();
            self.guard.open_words = 0;
        }
        result
    }

    fn append(&mut self, set: &mut Storeset, entries: &[RedoEntry], sqn: u64) -> Result<()> {
        for &(addr, value, mask) in entries {
            self.write(set, addr.0)?;
            self.write(set, value)?;
            self.write(set, mask)?;
        }
        self.write(set, COMMIT_MARKER)?;
        self.write(set, sqn)?;
        self.guard.log.flush(set)?;
        self.guard.open_words = 0;
        self.guard.commits += 1;
        Ok(())
    }

    /// Closes a record left open by a failed append with an abort marker.
    /// Returns whether there was one.
    pub fn abort_open(&mut self, set: &mut Storeset) -> Result<bool> {
        if self.guard.open_words == 0 {
            return Ok(false);
        }
        self.write(set, ABORT_MARKER)?;
        self.write(set, 0)?;
        self.guard.log.flush(set)?;
        self.guard.open_words = 0;
        self.guard.aborts += 1;
        Ok(true)
    }

    /// Drops every record, for logs truncated in the foreground.
    pub fn truncate_sync(&mut self, set: &mut Storeset) -> Result<()> {
        self.guard.log.truncate_sync(set)
    }

    /// Cursor snapshot.
    pub fn stats(&self) -> PhlogStats {
        self.guard.log.stats()
    }
}

/// What scanning one record produced.
enum Scan {
    Commit(u64),
    Abort,
    End { fragment: bool },
}

impl TmLogInner {
    /// Reads one record, feeding its entries to `visit`. The reader is left
    /// after the record, or back at its start when the record is incomplete.
    fn scan_record(&mut self, mut visit: impl FnMut(RedoEntry)) -> Result<Scan> {
        let mark = self.log.checkpoint()?;
        let mut words = 0u64;
        let outcome = loop {
            let first = match self.log.read() {
                Ok(word) => word,
                Err(MnemoError::NoData) => break Scan::End { fragment: words > 0 },
                Err(err) => return Err(err),
            };
            words += 1;
            match first {
                COMMIT_MARKER | ABORT_MARKER => {
                    let second = match self.log.read() {
                        Ok(word) => word,
                        Err(MnemoError::NoData) => break Scan::End { fragment: true },
                        Err(err) => return Err(err),
                    };
                    self.log.next_chunk();
                    break if first == COMMIT_MARKER {
                        Scan::Commit(second)
                    } else {
                        Scan::Abort
                    };
                }
                addr => {
                    let value = self.log.read();
                    let mask = self.log.read();
                    match (value, mask) {
                        (Ok(value), Ok(mask)) => {
                            words += 2;
                            visit((PAddr(addr), value, mask));
                        }
                        (Err(MnemoError::NoData), _) | (_, Err(MnemoError::NoData)) => {
                            break Scan::End { fragment: true };
                        }
                        (Err(err), _) | (_, Err(err)) => return Err(err),
                    }
                }
            }
        };
        if let Scan::End { .. } = outcome {
            self.log.restore(mark);
        }
        Ok(outcome)
    }
}

impl TmLog {
    /// Locks the log for appending.
    pub fn lock(&self) -> TmLogWriter<'_> {
        TmLogWriter {
            guard: self.inner.lock(),
        }
    }

    /// Encoding of the underlying ring.
    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Records committed and aborted through this instance.
    pub fn record_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.commits, inner.aborts)
    }

    fn line_of(&self, addr: PAddr) -> u64 {
        addr.align_down(self.line_log).0
    }
}

impl ManagedLog for TmLog {
    fn init(&self, set: &mut Storeset) -> Result<()> {
        match self.kind {
            LogKind::Base => BaseLog::format(set, &self.slot)?,
            LogKind::Tornbit => TornbitLog::format(set, &self.slot)?,
        }
        let mut log = open_physical(self.kind, set, self.slot)?;
        log.check_consistency()?;
        let mut inner = self.inner.lock();
        inner.log = log;
        inner.open_words = 0;
        inner.blocks.clear();
        inner.replay.clear();
        debug!(slot = self.slot.index, kind = ?self.kind, "tmlog.init");
        Ok(())
    }

    fn supports_truncation(&self) -> bool {
        true
    }

    fn truncation_init(&self, _set: &mut Storeset) -> Result<()> {
        let mut inner = self.inner.lock();
        let stats = inner.log.stats();
        inner.limit = stats.stable_tail;
        inner.log.restore(stats.head);
        inner.blocks.clear();
        Ok(())
    }

    fn truncation_prepare_next(&self, _set: &mut Storeset) -> Result<LogOrder> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        loop {
            if inner.log.checkpoint()? == inner.limit {
                return Ok(LogOrder::INVALID);
            }
            let mut lines = Vec::new();
            let scan = inner.scan_record(|(addr, _, _)| lines.push(self.line_of(addr)))?;
            match scan {
                Scan::Commit(sqn) => {
                    inner.blocks.extend(lines);
                    return Ok(LogOrder(sqn));
                }
                Scan::Abort => continue,
                Scan::End { .. } => return Ok(LogOrder::INVALID),
            }
        }
    }

    fn truncation_do(&self, set: &mut Storeset) -> Result<()> {
        let mut inner = self.inner.lock();
        for &line in &inner.blocks {
            set.writeback_line(PAddr(line))?;
        }
        inner.blocks.clear();
        inner.log.truncate_async(set)
    }

    fn supports_recovery(&self) -> bool {
        true
    }

    fn recovery_init(&self, _set: &mut Storeset) -> Result<()> {
        let mut inner = self.inner.lock();
        let stable = inner.log.check_consistency()?;
        let head = inner.log.stats().head;
        inner.log.restore(head);
        inner.replay.clear();
        debug!(slot = self.slot.index, head, stable, "tmlog.recovery.init");
        Ok(())
    }

    fn recovery_prepare_next(&self, set: &mut Storeset) -> Result<LogOrder> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        loop {
            let mut entries = Vec::new();
            match inner.scan_record(|entry| entries.push(entry))? {
                Scan::Commit(sqn) => {
                    inner.replay = entries;
                    return Ok(LogOrder(sqn));
                }
                Scan::Abort => continue,
                Scan::End { fragment } => {
                    if fragment {
                        warn!(slot = self.slot.index, "tmlog.recovery.fragment_discarded");
                    }
                    inner.replay.clear();
                    inner.log.truncate_sync(set)?;
                    return Ok(LogOrder::INVALID);
                }
            }
        }
    }

    fn recovery_do(&self, set: &mut Storeset) -> Result<()> {
        let replay = std::mem::take(&mut self.inner.lock().replay);
        let mut lines = FxHashSet::default();
        for &(addr, value, mask) in &replay {
            set.wb_store_masked(addr, value, mask)?;
            lines.insert(self.line_of(addr));
        }
        for line in lines {
            set.wb_flush(PAddr(line))?;
        }
        debug!(slot = self.slot.index, entries = replay.len(), "tmlog.recovery.replay");
        Ok(())
    }

    fn report_stats(&self) -> PhlogStats {
        self.inner.lock().log.stats()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
