#![forbid(unsafe_code)]
//! Transaction descriptor: barriers, commit and rollback.
//!
//! Writes are buffered in the write set under encounter-time locks and only
//! reach memory at commit, after the redo record is durable. Reads are
//! validated against a `[start, end]` snapshot that is extended on demand.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::cm::ContentionManager;
use super::locks::{LockState, LockTable};
use super::rwset::{ReadEntry, ReadSet, WriteSet};
use super::tmlog::{log_type_for, RedoEntry, TmLog, TmLogWriter};
use super::{StmShared, TxAccess};
use crate::config::Isolation;
use crate::log::{LogHandle, ASYNC_TRUNCATION};
use crate::metrics::StatTag;
use crate::pcm::Storeset;
use crate::primitives::bytes::WORD_SIZE;
use crate::types::{MnemoError, PAddr, RestartReason, Result};

/// Waits for the background thread before a log-full commit gives up.
const LOG_FULL_WAITS: u32 = 8;
const TRUNCATION_WAIT: Duration = Duration::from_secs(5);

type Action = Box<dyn FnOnce() + Send>;

/// Where a descriptor is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    /// No attempt has run yet.
    Idle,
    /// Inside [`Txn::run`].
    Active,
    /// The last attempt committed.
    Committed,
    /// The last attempt rolled back.
    Aborted,
}

/// A transaction descriptor, owned by one thread and reused across
/// transactions. Dropping it returns its log to the pool.
pub struct Txn {
    stm: Arc<StmShared>,
    set: Storeset,
    log: LogHandle,
    tmlog: Arc<TmLog>,
    locks: Arc<LockTable>,
    id: u32,
    state: TxState,
    nesting: u32,
    start: u64,
    end: u64,
    rset: ReadSet,
    wset: WriteSet,
    locals: Vec<(u64, u64)>,
    undo: Vec<(PAddr, u64)>,
    on_abort: Vec<Action>,
    on_commit: Vec<Action>,
    cm: ContentionManager,
    contended: Option<usize>,
    attempts: u64,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("log", &self.log)
            .field("reads", &self.rset.len())
            .field("writes", &self.wset.len())
            .finish()
    }
}

impl Txn {
    pub(crate) fn new(stm: Arc<StmShared>) -> Result<Self> {
        let mut set = Storeset::new(&stm.ctx);
        let config = &stm.config;
        let flags = if config.sync_truncation { 0 } else { ASYNC_TRUNCATION };
        let log = stm
            .manager
            .alloc_log(&mut set, log_type_for(config.log_type), flags)?;
        let Some(tmlog) = log.downcast::<TmLog>() else {
            stm.manager.free_log(&mut set, &log)?;
            return Err(MnemoError::Invalid("log slot does not hold a transactional log"));
        };
        let locks = match config.isolation {
            Isolation::Etl => Arc::clone(&stm.locks),
            Isolation::None => Arc::new(LockTable::new(config.lock_array_log_size)),
        };
        let id = stm.next_owner();
        let seed = u64::from(id).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        debug!(tx = id, slot = log.index(), "stm.descriptor.new");
        Ok(Self {
            rset: ReadSet::with_capacity(config.rw_set_capacity),
            wset: WriteSet::with_capacity(config.rw_set_capacity),
            cm: ContentionManager::new(config.contention_manager, seed),
            stm,
            set,
            log,
            tmlog,
            locks,
            id,
            state: TxState::Idle,
            nesting: 0,
            start: 0,
            end: 0,
            locals: Vec::new(),
            undo: Vec::new(),
            on_abort: Vec::new(),
            on_commit: Vec::new(),
            contended: None,
            attempts: 0,
        })
    }

    /// Owner id written into lock words.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Attempts made by the last [`Txn::run`].
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Pool slot of the descriptor's redo log.
    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    /// The descriptor's storeset, for non-transactional access.
    pub fn storeset(&mut self) -> &mut Storeset {
        &mut self.set
    }

    /// Runs `f` as a transaction until it commits.
    ///
    /// Conflicts restart `f` transparently. Any other error, including
    /// [`MnemoError::UserAbort`], rolls the attempt back and is returned.
    pub fn run<T>(&mut self, mut f: impl FnMut(&mut Txn) -> Result<T>) -> Result<T> {
        if self.state == TxState::Active {
            return Err(MnemoError::Invalid(
                "transaction already running; use Txn::nested",
            ));
        }
        self.attempts = 0;
        loop {
            self.begin();
            self.attempts += 1;
            let outcome = match f(self) {
                Ok(value) => self.commit().map(|()| value),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(MnemoError::Restart(reason)) => {
                    self.rollback()?;
                    self.stm.stats.increment(StatTag::Restart(reason), 1);
                    debug!(tx = self.id, reason = reason.as_str(), "stm.restart");
                    let contended = self.contended.take();
                    let locks = Arc::clone(&self.locks);
                    self.cm
                        .before_retry(reason, contended.map(|index| (&*locks, index)));
                }
                Err(err) => {
                    self.rollback()?;
                    self.stm.stats.increment(StatTag::Abort, 1);
                    debug!(tx = self.id, error = %err, "stm.abort");
                    return Err(err);
                }
            }
        }
    }

    /// Runs `f` inside the current transaction. Nesting is flattened: a
    /// conflict or abort inside `f` restarts or aborts the outermost run.
    pub fn nested<T>(&mut self, f: impl FnOnce(&mut Txn) -> Result<T>) -> Result<T> {
        self.ensure_active()?;
        self.nesting += 1;
        let out = f(self);
        self.nesting = self.nesting.saturating_sub(1);
        out
    }

    /// Current nesting depth; 1 at the top level of [`Txn::run`].
    pub fn nesting(&self) -> u32 {
        self.nesting
    }

    /// Restarts the transaction on request of the application.
    pub fn retry<T>(&self) -> Result<T> {
        Err(MnemoError::Restart(RestartReason::UserRetry))
    }

    /// Declares `[addr, addr + len)` private to this attempt. Stores to it
    /// are written through at once and undone on rollback.
    pub fn add_local_range(&mut self, addr: PAddr, len: u64) -> Result<()> {
        self.ensure_active()?;
        self.locals.push((addr.0, addr.0 + len));
        Ok(())
    }

    /// Registers `action` to run if this attempt rolls back. Actions run in
    /// reverse registration order.
    pub fn on_abort(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_abort.push(Box::new(action));
    }

    /// Registers `action` to run once this attempt commits.
    pub fn on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(action));
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(MnemoError::Invalid("no transaction is running"))
        }
    }

    fn check_addr(&self, addr: PAddr) -> Result<()> {
        if !addr.is_word_aligned() {
            return Err(MnemoError::Invalid("transactional access must be word aligned"));
        }
        if !self.set.context().region().contains(addr, WORD_SIZE) {
            return Err(MnemoError::InvalidOwned(format!(
                "transactional access to {addr} outside persistent region"
            )));
        }
        Ok(())
    }

    fn is_local(&self, addr: PAddr) -> bool {
        self.locals
            .iter()
            .any(|&(start, end)| addr.0 >= start && addr.0 < end)
    }

    fn begin(&mut self) {
        let now = self.stm.clock.now();
        self.start = now;
        self.end = now;
        self.rset.clear();
        self.wset.clear();
        self.locals.clear();
        self.undo.clear();
        self.on_abort.clear();
        self.on_commit.clear();
        self.contended = None;
        self.nesting = 1;
        self.state = TxState::Active;
    }

    /// Transactional load.
    pub fn load(&mut self, addr: PAddr) -> Result<u64> {
        self.ensure_active()?;
        self.check_addr(addr)?;
        if self.is_local(addr) {
            return self.set.load(addr);
        }
        let index = self.locks.index_of(addr);
        loop {
            let word = self.locks.load(index);
            match LockState::decode(word) {
                LockState::Owned { owner, entry } if owner == self.id => {
                    let memory = self.set.load(addr)?;
                    let value = self
                        .wset
                        .find(entry, addr)
                        .and_then(|i| self.wset.get(i))
                        .map_or(memory, |e| e.visible(memory));
                    return Ok(value);
                }
                LockState::Owned { .. } => {
                    self.contended = Some(index);
                    return Err(MnemoError::Restart(RestartReason::LockedRead));
                }
                LockState::Unlocked(version) => {
                    let value = self.set.load(addr)?;
                    if self.locks.load(index) != word {
                        continue;
                    }
                    if version > self.end && !self.extend() {
                        return Err(MnemoError::Restart(RestartReason::ValidateRead));
                    }
                    self.rset.push(ReadEntry {
                        lock: index,
                        version,
                    })?;
                    self.stm.stats.increment(StatTag::Read, 1);
                    return Ok(value);
                }
            }
        }
    }

    /// Transactional store of the bits of `value` selected by `bits`.
    pub fn store_masked(&mut self, addr: PAddr, value: u64, bits: u64) -> Result<()> {
        self.ensure_active()?;
        self.check_addr(addr)?;
        if bits == 0 {
            return Ok(());
        }
        if self.is_local(addr) {
            let old = self.set.load(addr)?;
            self.undo.push((addr, old));
            return self.set.wb_store_masked(addr, value, bits);
        }
        let index = self.locks.index_of(addr);
        loop {
            let word = self.locks.load(index);
            match LockState::decode(word) {
                LockState::Owned { owner, entry } if owner == self.id => {
                    self.wset.merge(entry, addr, value, bits)?;
                    break;
                }
                LockState::Owned { .. } => {
                    self.contended = Some(index);
                    return Err(MnemoError::Restart(RestartReason::LockedWrite));
                }
                LockState::Unlocked(version) => {
                    if version > self.end && !self.extend() {
                        return Err(MnemoError::Restart(RestartReason::ValidateWrite));
                    }
                    let entry = self.wset.push_head(addr, value, bits, index, version)?;
                    if self
                        .locks
                        .cas(index, word, LockState::owned(self.id, entry))
                    {
                        break;
                    }
                    self.wset.pop_head();
                }
            }
        }
        self.stm.stats.increment(StatTag::Write, 1);
        Ok(())
    }

    fn validate(&self) -> bool {
        self.rset
            .iter()
            .all(|read| match LockState::decode(self.locks.load(read.lock)) {
                LockState::Owned { owner, entry } => {
                    owner == self.id
                        && self
                            .wset
                            .get(entry)
                            .is_some_and(|e| e.version == read.version)
                }
                LockState::Unlocked(version) => version == read.version,
            })
    }

    fn extend(&mut self) -> bool {
        let now = self.stm.clock.now();
        if self.validate() {
            self.end = now;
            true
        } else {
            false
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.wset.is_empty() {
            self.finish_commit();
            return Ok(());
        }
        let sqn = self.stm.clock.tick();
        if sqn > self.end + 1 && !self.validate() {
            return Err(MnemoError::Restart(RestartReason::ValidateCommit));
        }
        let mut entries: Vec<RedoEntry> = self
            .wset
            .iter()
            .map(|e| (e.addr, e.value, e.mask))
            .collect();
        entries.sort_by_key(|e| e.0);

        let tmlog = Arc::clone(&self.tmlog);
        let mut writer = self.append_record(&tmlog, &entries, sqn)?;
        self.stm.stats.increment(StatTag::LogFlush, 1);
        self.install(&entries)?;
        if self.stm.config.sync_truncation {
            writer.truncate_sync(&mut self.set)?;
            self.stm.stats.increment(StatTag::Truncation, 1);
        }
        self.release_locks(Some(sqn));
        drop(writer);
        debug!(tx = self.id, sqn, writes = entries.len(), "stm.commit");
        self.finish_commit();
        Ok(())
    }

    /// Makes the redo record durable, handling a full log, and returns the
    /// writer still locked.
    fn append_record<'a>(
        &mut self,
        tmlog: &'a TmLog,
        entries: &[RedoEntry],
        sqn: u64,
    ) -> Result<TmLogWriter<'a>> {
        let manager = Arc::clone(&self.stm.manager);
        let mut full = 0u32;
        loop {
            let gate = manager.append_gate();
            let mut writer = tmlog.lock();
            let result = writer.append_commit(&mut self.set, entries, sqn);
            drop(gate);
            match result {
                Ok(()) => return Ok(writer),
                Err(MnemoError::LogFull) => full += 1,
                Err(err) => return Err(err),
            }
            if self.stm.config.sync_truncation {
                if full > 1 {
                    return Err(MnemoError::Corruption("log full after forced truncation"));
                }
                warn!(tx = self.id, sqn, "stm.log_full.forced_truncation");
                writer.truncate_sync(&mut self.set)?;
                self.stm.stats.increment(StatTag::Truncation, 1);
            } else {
                drop(writer);
                if full > LOG_FULL_WAITS {
                    return Err(MnemoError::Corruption("log full after forced truncation"));
                }
                self.stm.stats.increment(StatTag::WaitForTruncation, 1);
                debug!(tx = self.id, sqn, full, "stm.log_full.wait");
                manager.request_truncation_and_wait(&mut self.set, TRUNCATION_WAIT)?;
            }
        }
    }

    /// Applies the sorted write set, flushing each cacheline after its last
    /// entry.
    fn install(&mut self, entries: &[RedoEntry]) -> Result<()> {
        let line_log = self.set.context().config().cacheline_size_log;
        for (i, &(addr, value, bits)) in entries.iter().enumerate() {
            self.set.wb_store_masked(addr, value, bits)?;
            let line = addr.align_down(line_log);
            let last_in_line = entries
                .get(i + 1)
                .map_or(true, |next| next.0.align_down(line_log) != line);
            if last_in_line {
                self.set.wb_flush(addr)?;
            }
        }
        Ok(())
    }

    /// Releases every owned lock at `commit`, or at its old version.
    fn release_locks(&self, commit: Option<u64>) {
        for entry in self.wset.iter().filter(|e| e.head) {
            let version = commit.unwrap_or(entry.version);
            self.locks.release(entry.lock, LockState::unlocked(version));
        }
    }

    fn finish_commit(&mut self) {
        for action in std::mem::take(&mut self.on_commit) {
            action();
        }
        self.on_abort.clear();
        self.undo.clear();
        self.rset.clear();
        self.wset.clear();
        self.nesting = 0;
        self.state = TxState::Committed;
        self.cm.on_commit();
        self.stm.stats.increment(StatTag::Commit, 1);
    }

    fn rollback(&mut self) -> Result<()> {
        self.release_locks(None);
        self.wset.clear();
        self.rset.clear();
        self.nesting = 0;
        self.state = TxState::Aborted;
        {
            let tmlog = Arc::clone(&self.tmlog);
            let mut writer = tmlog.lock();
            if writer.abort_open(&mut self.set)? {
                debug!(tx = self.id, "stm.rollback.abort_record");
            }
        }
        while let Some((addr, old)) = self.undo.pop() {
            self.set.wb_store(addr, old)?;
        }
        for action in std::mem::take(&mut self.on_abort).into_iter().rev() {
            action();
        }
        self.on_commit.clear();
        Ok(())
    }
}

impl TxAccess for Txn {
    fn load(&mut self, addr: PAddr) -> Result<u64> {
        Txn::load(self, addr)
    }

    fn store_masked(&mut self, addr: PAddr, value: u64, bits: u64) -> Result<()> {
        Txn::store_masked(self, addr, value, bits)
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.release_locks(None);
        }
        if let Err(err) = self.stm.manager.free_log(&mut self.set, &self.log) {
            warn!(tx = self.id, error = %err, "stm.descriptor.free_log_failed");
        }
        debug!(tx = self.id, "stm.descriptor.drop");
    }
}
