#![forbid(unsafe_code)]
//! Persistent-memory emulation.
//!
//! [`PcmContext`] is the process-wide state: the emulated region, the
//! storeset registry and the crash coordinator. Threads write through their
//! own [`Storeset`], which remembers the pre-write bytes of every cacheline
//! that has not been flushed yet. [`PcmContext::trigger_crash`] freezes all
//! storesets, lets a random subset of dirty lines reach the medium (possibly
//! only partly, per the crash distribution) and rolls back the rest.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::PcmConfig;
use crate::primitives::region::PmemRegion;
use crate::types::{MnemoError, PAddr, Result};

mod crash;
pub mod latency;
pub mod shadow;
pub mod storeset;

pub use latency::{CrashCdf, LatencyModel, Lcg};
pub use shadow::{CachelineShadow, ShadowTable};
pub use storeset::{put_current, with_current, Storeset, StoresetShared};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide emulation mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Writes proceed.
    Normal,
    /// A crash is being replayed; writers are held.
    Crash,
    /// Replay finished; writers resume against the rolled-back state.
    PostCrash,
}

#[derive(Debug)]
struct CrashState {
    mode: Mode,
    waiters: usize,
}

/// What one crash replay did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrashReport {
    /// Storesets visited.
    pub storesets: usize,
    /// Dirty lines written back by simulated eviction.
    pub evicted_lines: usize,
    /// Bytes rolled back to their pre-write value.
    pub restored_bytes: usize,
}

/// Emulation state shared by every thread of one process incarnation.
pub struct PcmContext {
    id: u64,
    seed: u32,
    config: PcmConfig,
    region: Arc<PmemRegion>,
    cdf: CrashCdf,
    latency: LatencyModel,
    registry: Mutex<Vec<Arc<StoresetShared>>>,
    next_storeset: AtomicU64,
    crash: Mutex<CrashState>,
    cond_halt: Condvar,
    cond_waiters: Condvar,
    outstanding: AtomicBool,
    image: Mutex<Option<Arc<PmemRegion>>>,
}

impl std::fmt::Debug for PcmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmContext")
            .field("id", &self.id)
            .field("region_len", &self.region.len())
            .field("mode", &self.mode())
            .finish()
    }
}

impl PcmContext {
    /// Builds a context over `region`, or over a fresh zeroed region of
    /// `config.region_bytes` when `None`.
    pub fn new(config: PcmConfig, region: Option<Arc<PmemRegion>>) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|err| MnemoError::InvalidOwned(err.to_string()))?;
        let region = match region {
            Some(region) => region,
            None => Arc::new(PmemRegion::new(config.region_bytes)?),
        };
        let cdf = CrashCdf::from_weights(&config.crash_cdf)?;
        let latency = LatencyModel::new(&config);
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let seed = rand::random::<u32>() ^ (id as u32).wrapping_mul(0x9e37_79b9);
        debug!(context = id, region = region.len(), "pcm.context.new");
        Ok(Arc::new(Self {
            id,
            seed,
            config,
            region,
            cdf,
            latency,
            registry: Mutex::new(Vec::new()),
            next_storeset: AtomicU64::new(1),
            crash: Mutex::new(CrashState {
                mode: Mode::Normal,
                waiters: 0,
            }),
            cond_halt: Condvar::new(),
            cond_waiters: Condvar::new(),
            outstanding: AtomicBool::new(false),
            image: Mutex::new(None),
        }))
    }

    /// Unique id of this context within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Emulation settings.
    pub fn config(&self) -> &PcmConfig {
        &self.config
    }

    /// The emulated persistent memory.
    pub fn region(&self) -> &Arc<PmemRegion> {
        &self.region
    }

    /// Partial-write distribution.
    pub fn cdf(&self) -> &CrashCdf {
        &self.cdf
    }

    /// Latency model.
    pub fn latency(&self) -> &LatencyModel {
        &self.latency
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.crash.lock().mode
    }

    /// Live storesets.
    pub fn storeset_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn seed(&self) -> u32 {
        self.seed
    }

    pub(crate) fn next_storeset_id(&self) -> u64 {
        self.next_storeset.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn crash_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, shared: Arc<StoresetShared>) {
        debug!(context = self.id, storeset = shared.id, "pcm.storeset.register");
        self.registry.lock().push(shared);
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.registry.lock().retain(|s| s.id != id);
        debug!(context = self.id, storeset = id, "pcm.storeset.deregister");
    }

    /// Parks the calling thread while a crash is being replayed.
    pub fn check_crash(&self) {
        if !self.crash_outstanding() {
            return;
        }
        let mut state = self.crash.lock();
        state.waiters += 1;
        self.cond_waiters.notify_all();
        while state.mode == Mode::Crash {
            self.cond_halt.wait(&mut state);
        }
    }

    /// Replays a crash.
    ///
    /// `caller` is the storeset of the calling thread, if it has one; with
    /// `wait_halt` the coordinator first waits for every other storeset
    /// owner to park in [`PcmContext::check_crash`]. Returns `None` when a
    /// crash was already in progress or has completed without a reset.
    pub fn trigger_crash(
        &self,
        caller: Option<&Storeset>,
        wait_halt: bool,
    ) -> Result<Option<CrashReport>> {
        let mut state = self.crash.lock();
        match state.mode {
            Mode::Crash => {
                drop(state);
                self.check_crash();
                return Ok(None);
            }
            Mode::PostCrash => return Ok(None),
            Mode::Normal => {}
        }
        state.mode = Mode::Crash;
        state.waiters = 0;
        self.outstanding.store(true, Ordering::SeqCst);
        debug!(context = self.id, wait_halt, "pcm.crash.begin");

        if wait_halt {
            let own = usize::from(caller.is_some());
            loop {
                let needed = self.storeset_count().saturating_sub(own);
                if state.waiters >= needed {
                    break;
                }
                self.cond_waiters.wait(&mut state);
            }
        }

        let sets: Vec<Arc<StoresetShared>> = self.registry.lock().clone();
        for set in &sets {
            while set.in_crash.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
        }

        let mut report = CrashReport {
            storesets: sets.len(),
            ..CrashReport::default()
        };
        let mut failure = None;
        for set in &sets {
            let mut shadow = set.state.lock();
            let evicted =
                shadow.evict_random(self.config.likelihood_evicted_cacheline, &self.cdf);
            report.evicted_lines += evicted;
            match shadow.restore(&self.region) {
                Ok(bytes) => report.restored_bytes += bytes,
                Err(err) => failure = Some(err),
            }
            debug!(storeset = set.id, evicted, "pcm.crash.storeset");
        }

        *self.image.lock() = Some(Arc::new(self.region.snapshot()));
        state.mode = Mode::PostCrash;
        self.outstanding.store(false, Ordering::SeqCst);
        self.cond_halt.notify_all();
        debug!(
            context = self.id,
            storesets = report.storesets,
            evicted = report.evicted_lines,
            restored = report.restored_bytes,
            "pcm.crash.end"
        );
        match failure {
            Some(err) => Err(err),
            None => Ok(Some(report)),
        }
    }

    /// Returns to [`Mode::Normal`] so another crash can be triggered.
    pub fn trigger_crash_reset(&self) {
        let mut state = self.crash.lock();
        state.mode = Mode::Normal;
        state.waiters = 0;
        self.outstanding.store(false, Ordering::SeqCst);
        self.cond_halt.notify_all();
        debug!(context = self.id, "pcm.crash.reset");
    }

    /// Copy of the region taken right after the last crash replay.
    ///
    /// A restarted incarnation should be built over this image; the live
    /// region keeps receiving writes from threads that outlived the crash.
    pub fn crash_image(&self) -> Option<Arc<PmemRegion>> {
        self.image.lock().clone()
    }

    /// Marks the line(s) holding the word at `addr` durable in every
    /// storeset, for writers flushing data other threads stored.
    pub(crate) fn writeback_line(&self, addr: PAddr) {
        let sets: Vec<Arc<StoresetShared>> = self.registry.lock().clone();
        for set in sets {
            set.state.lock().flush(addr, false, &self.cdf);
        }
    }
}
