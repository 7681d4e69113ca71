#![forbid(unsafe_code)]
//! Durable software transactional memory.
//!
//! [`Stm`] is shared by every thread; each thread runs transactions through
//! its own [`Txn`] descriptor, which owns a storeset and a redo log from the
//! pool. Reads and writes go through [`TxAccess`], which is also implemented
//! by [`Storeset`] so the same code can run outside a transaction.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::{LogKind, StmConfig};
use crate::log::LogManager;
use crate::metrics::StatsSink;
use crate::pcm::{PcmContext, Storeset};
use crate::primitives::bytes::{mask, WORD_SIZE};
use crate::types::{MnemoError, PAddr, Result};

pub mod cm;
pub mod locks;
pub mod rwset;
pub mod tmlog;
mod txn;

pub use locks::{Clock, LockState, LockTable};
pub use tmlog::{log_type_for, TmLog, TmLogOps, TM_BASE_LOG, TM_TORNBIT_LOG};
pub use txn::{TxState, Txn};

static NEXT_STM_ID: AtomicU64 = AtomicU64::new(1);

/// Word and byte access, inside or outside a transaction.
pub trait TxAccess {
    /// Loads the word at `addr`.
    fn load(&mut self, addr: PAddr) -> Result<u64>;

    /// Stores the bits of `value` selected by `bits` into the word at `addr`.
    fn store_masked(&mut self, addr: PAddr, value: u64, bits: u64) -> Result<()>;

    /// Stores a whole word.
    fn store(&mut self, addr: PAddr, value: u64) -> Result<()> {
        self.store_masked(addr, value, mask::FULL)
    }

    /// Copies `dst.len()` bytes starting at `addr`, one word access at a time.
    fn load_bytes(&mut self, addr: PAddr, dst: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < dst.len() {
            let at = addr.0 + done as u64;
            let word = PAddr(at & !(WORD_SIZE - 1));
            let first = (at - word.0) as usize;
            let n = (WORD_SIZE as usize - first).min(dst.len() - done);
            let bytes = self.load(word)?.to_le_bytes();
            dst[done..done + n].copy_from_slice(&bytes[first..first + n]);
            done += n;
        }
        Ok(())
    }

    /// Stores `src` starting at `addr` with masked word stores, leaving the
    /// surrounding bytes of partial words untouched.
    fn store_bytes(&mut self, addr: PAddr, src: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < src.len() {
            let at = addr.0 + done as u64;
            let word = PAddr(at & !(WORD_SIZE - 1));
            let first = (at - word.0) as usize;
            let n = (WORD_SIZE as usize - first).min(src.len() - done);
            let mut buf = [0u8; WORD_SIZE as usize];
            buf[first..first + n].copy_from_slice(&src[done..done + n]);
            self.store_masked(word, u64::from_le_bytes(buf), mask::bytes(first as u32, n as u32)?)?;
            done += n;
        }
        Ok(())
    }
}

impl TxAccess for Storeset {
    fn load(&mut self, addr: PAddr) -> Result<u64> {
        Storeset::load(self, addr)
    }

    fn store_masked(&mut self, addr: PAddr, value: u64, bits: u64) -> Result<()> {
        self.wb_store_masked(addr, value, bits)
    }
}

/// Registers the operations of both transactional log encodings, so pool
/// slots left by either can be recovered.
pub fn register_log_types(manager: &LogManager, set: &mut Storeset) -> Result<()> {
    for kind in [LogKind::Base, LogKind::Tornbit] {
        manager.register_logtype(set, log_type_for(kind), Arc::new(TmLogOps::new(kind)))?;
    }
    Ok(())
}

pub(crate) struct StmShared {
    id: u64,
    pub(crate) ctx: Arc<PcmContext>,
    pub(crate) manager: Arc<LogManager>,
    pub(crate) clock: Clock,
    pub(crate) locks: Arc<LockTable>,
    pub(crate) config: StmConfig,
    pub(crate) stats: Arc<dyn StatsSink>,
    next_owner: AtomicU32,
}

impl StmShared {
    /// Next lock owner id, skipping 0 and wrapping within the lock word.
    pub(crate) fn next_owner(&self) -> u32 {
        let raw = self.next_owner.fetch_add(1, Ordering::Relaxed);
        raw % locks::MAX_OWNER + 1
    }
}

/// Transaction engine over one log manager.
#[derive(Clone)]
pub struct Stm {
    shared: Arc<StmShared>,
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("id", &self.shared.id)
            .field("clock", &self.shared.clock.now())
            .field("config", &self.shared.config)
            .finish()
    }
}

thread_local! {
    static DESCRIPTORS: RefCell<Vec<(u64, Txn)>> = const { RefCell::new(Vec::new()) };
    static RUNNING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

impl Stm {
    /// Engine over `manager`, whose transactional log types must already be
    /// registered (see [`register_log_types`]).
    pub fn new(
        manager: Arc<LogManager>,
        config: StmConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| MnemoError::InvalidOwned(err.to_string()))?;
        let id = NEXT_STM_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            stm = id,
            locks = 1u64 << config.lock_array_log_size,
            sync_truncation = config.sync_truncation,
            "stm.init"
        );
        Ok(Self {
            shared: Arc::new(StmShared {
                id,
                ctx: Arc::clone(manager.context()),
                locks: Arc::new(LockTable::new(config.lock_array_log_size)),
                clock: Clock::starting_at(0),
                manager,
                config,
                stats,
                next_owner: AtomicU32::new(0),
            }),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &StmConfig {
        &self.shared.config
    }

    /// Log manager the descriptors draw their logs from.
    pub fn manager(&self) -> &Arc<LogManager> {
        &self.shared.manager
    }

    /// Emulation context.
    pub fn context(&self) -> &Arc<PcmContext> {
        &self.shared.ctx
    }

    /// Latest commit timestamp.
    pub fn clock(&self) -> u64 {
        self.shared.clock.now()
    }

    /// A fresh descriptor with its own log.
    pub fn descriptor(&self) -> Result<Txn> {
        Txn::new(Arc::clone(&self.shared))
    }

    /// Runs `f` as a transaction on this thread's cached descriptor.
    ///
    /// Calling `run` again from inside `f` is rejected; use [`Txn::nested`].
    pub fn run<T>(&self, f: impl FnMut(&mut Txn) -> Result<T>) -> Result<T> {
        let key = self.shared.id;
        if RUNNING.with(|running| running.borrow().contains(&key)) {
            return Err(MnemoError::Invalid("Stm::run is not reentrant; use Txn::nested"));
        }
        let taken = DESCRIPTORS.with(|cell| {
            let mut cached = cell.borrow_mut();
            cached
                .iter()
                .position(|(id, _)| *id == key)
                .map(|i| cached.swap_remove(i).1)
        });
        let mut txn = match taken {
            Some(txn) => txn,
            None => self.descriptor()?,
        };
        RUNNING.with(|running| running.borrow_mut().push(key));
        let out = txn.run(f);
        RUNNING.with(|running| running.borrow_mut().retain(|id| *id != key));
        DESCRIPTORS.with(|cell| cell.borrow_mut().push((key, txn)));
        out
    }

    /// Drops this thread's cached descriptor, returning its log to the pool.
    pub fn release_current(&self) {
        let key = self.shared.id;
        let taken = DESCRIPTORS.with(|cell| {
            let mut cached = cell.borrow_mut();
            cached
                .iter()
                .position(|(id, _)| *id == key)
                .map(|i| cached.swap_remove(i).1)
        });
        drop(taken);
    }
}
