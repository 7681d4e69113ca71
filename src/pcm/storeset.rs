#![forbid(unsafe_code)]
//! Per-thread store bookkeeping and the emulated store/flush primitives.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::crash::ShadowState;
use super::latency::Lcg;
use super::PcmContext;
use crate::primitives::bytes::{mask, WORD_SIZE};
use crate::types::{MnemoError, PAddr, Result};

/// The part of a storeset the crash coordinator can reach.
#[derive(Debug)]
pub struct StoresetShared {
    pub(crate) id: u64,
    pub(crate) in_crash: AtomicBool,
    pub(crate) state: Mutex<ShadowState>,
}

impl StoresetShared {
    /// Registry id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lines currently holding undurable bytes.
    pub fn pending_lines(&self) -> usize {
        self.state.lock().table.len()
    }
}

struct EmulationGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for EmulationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Store bookkeeping owned by a single thread.
///
/// Every write to emulated persistent memory goes through one of the store
/// methods here so that undurable bytes can be rolled back by a crash.
pub struct Storeset {
    shared: Arc<StoresetShared>,
    ctx: Arc<PcmContext>,
    rng: Lcg,
    wcbuf: Vec<Option<u64>>,
    wcbuf_count: u32,
    seq_len: u64,
}

impl std::fmt::Debug for Storeset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storeset")
            .field("id", &self.shared.id)
            .field("wcbuf_count", &self.wcbuf_count)
            .field("seq_len", &self.seq_len)
            .finish()
    }
}

impl Storeset {
    /// Creates a storeset and registers it with `ctx`.
    pub fn new(ctx: &Arc<PcmContext>) -> Self {
        let id = ctx.next_storeset_id();
        let seed = (id as u32).wrapping_mul(2_654_435_761) ^ ctx.seed();
        let config = ctx.config();
        let shared = Arc::new(StoresetShared {
            id,
            in_crash: AtomicBool::new(false),
            state: Mutex::new(ShadowState::new(
                config.shadow_capacity,
                config.cacheline_size_log,
                seed,
            )),
        });
        ctx.register(Arc::clone(&shared));
        Self {
            shared,
            ctx: Arc::clone(ctx),
            rng: Lcg::new(seed.rotate_left(16)),
            wcbuf: vec![None; config.wcbuf_capacity as usize * 4],
            wcbuf_count: 0,
            seq_len: 0,
        }
    }

    /// Registry id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The context this storeset belongs to.
    pub fn context(&self) -> &Arc<PcmContext> {
        &self.ctx
    }

    /// Lines currently holding undurable bytes.
    pub fn pending_lines(&self) -> usize {
        self.shared.pending_lines()
    }

    /// Blocks while a crash is being replayed.
    pub fn check_crash(&self) {
        self.ctx.check_crash();
    }

    fn enter(&self) -> EmulationGuard<'_> {
        loop {
            self.ctx.check_crash();
            self.shared.in_crash.store(true, Ordering::SeqCst);
            if !self.ctx.crash_outstanding() {
                return EmulationGuard {
                    flag: &self.shared.in_crash,
                };
            }
            self.shared.in_crash.store(false, Ordering::SeqCst);
        }
    }

    fn check_word(&self, addr: PAddr) -> Result<()> {
        if self.ctx.region().contains(addr, WORD_SIZE) {
            Ok(())
        } else {
            Err(MnemoError::InvalidOwned(format!(
                "store to {addr} outside persistent region"
            )))
        }
    }

    fn save(&self, state: &mut ShadowState, addr: PAddr, bits: u64) -> Result<()> {
        match state.save(self.ctx.region(), addr, bits) {
            Err(MnemoError::ShadowExhausted) => {
                warn!(storeset = self.shared.id, addr = addr.0, "pcm.shadow.save_skipped");
                Ok(())
            }
            other => other,
        }
    }

    /// Loads the word at `addr`.
    pub fn load(&self, addr: PAddr) -> Result<u64> {
        self.ctx.region().load(addr)
    }

    /// Write-back store of a whole word.
    pub fn wb_store(&mut self, addr: PAddr, val: u64) -> Result<()> {
        self.wb_store_masked(addr, val, mask::FULL)
    }

    /// Write-back store of the bits of `val` selected by `bits`.
    pub fn wb_store_masked(&mut self, addr: PAddr, val: u64, bits: u64) -> Result<()> {
        self.check_word(addr)?;
        if self.ctx.config().crash_emulation {
            let _guard = self.enter();
            let mut state = self.shared.state.lock();
            self.save(&mut state, addr, bits)?;
            self.ctx.region().store_masked(addr, val, bits)?;
        } else {
            self.ctx.region().store_masked(addr, val, bits)?;
        }
        let latency = self.ctx.latency();
        if latency.enabled() && self.rng.chance(latency.store_blockwaits()) {
            latency.spin(1);
        }
        Ok(())
    }

    /// Writes back the cacheline(s) holding the word at `addr`.
    pub fn wb_flush(&mut self, addr: PAddr) -> Result<()> {
        self.check_word(addr)?;
        if self.ctx.config().crash_emulation {
            let _guard = self.enter();
            // Outside a crash every write-back is complete.
            self.shared.state.lock().flush(addr, false, self.ctx.cdf());
        }
        self.ctx.check_crash();
        self.ctx.latency().spin(1);
        Ok(())
    }

    fn track_streaming(&self, addr: PAddr, val: u64, bits: u64) -> Result<()> {
        if !self.ctx.config().crash_emulation {
            return self.ctx.region().store_masked(addr, val, bits);
        }
        let _guard = self.enter();
        let mut state = self.shared.state.lock();
        let needed = state.lines_needed(addr);
        if state.table.len() + needed > self.ctx.config().wcbuf_capacity as usize {
            // Outside a crash every write-back is complete.
            state.flush_all(false, self.ctx.cdf());
        }
        self.save(&mut state, addr, bits)?;
        self.ctx.region().store_masked(addr, val, bits)
    }

    /// Non-temporal store of a whole word.
    pub fn nt_store(&mut self, addr: PAddr, val: u64) -> Result<()> {
        self.check_word(addr)?;
        self.track_streaming(addr, val, mask::FULL)?;
        if self.ctx.latency().enabled() {
            self.wcbuf_insert(addr.0 >> self.ctx.config().cacheline_size_log);
        }
        Ok(())
    }

    fn wcbuf_insert(&mut self, line: u64) {
        let size = self.wcbuf.len();
        loop {
            let start = (line % size as u64) as usize;
            for probe in 0..size {
                let idx = (start + probe) % size;
                let slot = self.wcbuf[idx];
                match slot {
                    Some(existing) if existing == line => return,
                    Some(_) => continue,
                    None if self.wcbuf_count < self.ctx.config().wcbuf_capacity => {
                        self.wcbuf[idx] = Some(line);
                        self.wcbuf_count += 1;
                        return;
                    }
                    None => break,
                }
            }
            self.drain_wcbuf();
        }
    }

    fn drain_wcbuf(&mut self) {
        self.ctx.latency().spin(self.wcbuf_count as u64);
        self.wcbuf.iter_mut().for_each(|slot| *slot = None);
        self.wcbuf_count = 0;
    }

    /// Drains the write-combining buffers.
    pub fn nt_flush(&mut self) -> Result<()> {
        self.ctx.check_crash();
        if self.ctx.config().crash_emulation {
            let _guard = self.enter();
            // Outside a crash every write-back is complete.
            self.shared.state.lock().flush_all(false, self.ctx.cdf());
        }
        self.drain_wcbuf();
        Ok(())
    }

    /// Store that is part of a long ascending run, such as a log append.
    pub fn seq_store(&mut self, addr: PAddr, val: u64) -> Result<()> {
        self.check_word(addr)?;
        self.track_streaming(addr, val, mask::FULL)?;
        let latency = self.ctx.latency();
        if latency.enabled() {
            self.seq_len = (self.seq_len + 1) & latency.stream_period_mask();
            if self.seq_len == 0 {
                latency.spin(1);
            }
        }
        Ok(())
    }

    /// Ends a sequential run and makes it durable.
    pub fn seq_flush(&mut self) -> Result<()> {
        self.ctx.check_crash();
        if self.ctx.config().crash_emulation {
            let _guard = self.enter();
            // Outside a crash every write-back is complete.
            self.shared.state.lock().flush_all(false, self.ctx.cdf());
        }
        if self.seq_len > 0 {
            self.ctx.latency().spin(1);
        }
        self.seq_len = 0;
        Ok(())
    }

    /// Writes back the line holding `addr` on behalf of every storeset.
    pub fn writeback_line(&mut self, addr: PAddr) -> Result<()> {
        self.check_word(addr)?;
        if self.ctx.config().crash_emulation {
            let _guard = self.enter();
            self.ctx.writeback_line(addr);
        }
        self.ctx.latency().spin(1);
        Ok(())
    }
}

impl Drop for Storeset {
    fn drop(&mut self) {
        self.ctx.check_crash();
        self.ctx.deregister(self.shared.id);
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<(u64, Storeset)>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with this thread's storeset for `ctx`, creating it on first use.
pub fn with_current<R>(ctx: &Arc<PcmContext>, f: impl FnOnce(&mut Storeset) -> R) -> R {
    let key = ctx.id();
    let taken = CURRENT.with(|cell| {
        let mut sets = cell.borrow_mut();
        sets.iter()
            .position(|(id, _)| *id == key)
            .map(|i| sets.swap_remove(i).1)
    });
    let mut set = taken.unwrap_or_else(|| Storeset::new(ctx));
    let out = f(&mut set);
    CURRENT.with(|cell| cell.borrow_mut().push((key, set)));
    out
}

/// Destroys this thread's storeset for `ctx`, if one exists.
pub fn put_current(ctx: &PcmContext) {
    let key = ctx.id();
    let taken = CURRENT.with(|cell| {
        let mut sets = cell.borrow_mut();
        sets.iter()
            .position(|(id, _)| *id == key)
            .map(|i| sets.swap_remove(i).1)
    });
    drop(taken);
}
