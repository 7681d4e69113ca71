#![forbid(unsafe_code)]
//! Process lifecycle: builds the emulation context, the log manager and the
//! transaction engine in the order recovery needs, and tears them down.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::MnemoConfig;
use crate::log::LogManager;
use crate::metrics::StatsSink;
use crate::pcm::{put_current, CrashReport, PcmContext, Storeset};
use crate::primitives::io::FileIo;
use crate::primitives::region::PmemRegion;
use crate::stm::{register_log_types, Stm, Txn};
use crate::types::{MnemoError, Result};

/// One process incarnation.
pub struct Runtime {
    config: MnemoConfig,
    ctx: Arc<PcmContext>,
    manager: Arc<LogManager>,
    stm: Stm,
    stats: Arc<dyn StatsSink>,
    recovered: u64,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.ctx.id())
            .field("recovered", &self.recovered)
            .field("manager", &self.manager)
            .finish()
    }
}

impl Runtime {
    /// Starts a first incarnation over a fresh zeroed region.
    pub fn on_first_use(config: MnemoConfig, stats: Arc<dyn StatsSink>) -> Result<Self> {
        Self::open(config, None, stats)
    }

    /// Starts an incarnation over `region`, or a fresh one when `None`.
    ///
    /// Registers both transactional log encodings before recovering, so
    /// committed records left by a previous incarnation are replayed before
    /// any transaction runs.
    pub fn open(
        config: MnemoConfig,
        region: Option<Arc<PmemRegion>>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| MnemoError::InvalidOwned(err.to_string()))?;
        let ctx = PcmContext::new(config.pcm.clone(), region)?;
        let mut set = Storeset::new(&ctx);
        let manager = LogManager::init(&mut set)?;
        register_log_types(&manager, &mut set)?;
        let recovered = manager.do_recovery(&mut set)?;
        drop(set);
        if !config.stm.sync_truncation {
            manager.start_truncation(config.stm.truncation_interval())?;
        }
        let stm = Stm::new(Arc::clone(&manager), config.stm.clone(), Arc::clone(&stats))?;
        info!(
            context = ctx.id(),
            recovered,
            log_type = ?config.stm.log_type,
            sync_truncation = config.stm.sync_truncation,
            "runtime.start"
        );
        Ok(Self {
            config,
            ctx,
            manager,
            stm,
            stats,
            recovered,
        })
    }

    /// Starts the next incarnation over the image captured by the last
    /// crash of this one.
    pub fn restart_from_crash(&self) -> Result<Self> {
        let image = self
            .ctx
            .crash_image()
            .ok_or(MnemoError::Invalid("no crash has been replayed"))?;
        debug!(context = self.ctx.id(), "runtime.restart.crash_image");
        Self::open(self.config.clone(), Some(image), Arc::clone(&self.stats))
    }

    /// Starts an incarnation over a region image saved with
    /// [`Runtime::save_image`].
    pub fn restart_from_image(
        config: MnemoConfig,
        io: &dyn FileIo,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let region = PmemRegion::load_image(io)?;
        Self::open(config, Some(Arc::new(region)), stats)
    }

    /// Writes the current region contents to `io`.
    pub fn save_image(&self, io: &dyn FileIo) -> Result<()> {
        self.ctx.region().save_image(io)
    }

    /// Replays a crash of this incarnation; see [`PcmContext::trigger_crash`].
    pub fn crash(&self, caller: Option<&Storeset>, wait_halt: bool) -> Result<Option<CrashReport>> {
        self.ctx.trigger_crash(caller, wait_halt)
    }

    /// Configuration in force.
    pub fn config(&self) -> &MnemoConfig {
        &self.config
    }

    /// Emulation context.
    pub fn context(&self) -> &Arc<PcmContext> {
        &self.ctx
    }

    /// Log manager.
    pub fn manager(&self) -> &Arc<LogManager> {
        &self.manager
    }

    /// Transaction engine.
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Log records replayed when this incarnation started.
    pub fn recovered(&self) -> u64 {
        self.recovered
    }

    /// A fresh transaction descriptor.
    pub fn descriptor(&self) -> Result<Txn> {
        self.stm.descriptor()
    }

    /// Runs `f` as a transaction on this thread's cached descriptor.
    pub fn run<T>(&self, f: impl FnMut(&mut Txn) -> Result<T>) -> Result<T> {
        self.stm.run(f)
    }

    /// Stops the truncation thread and drops the calling thread's cached
    /// descriptor and storeset. Other threads release theirs with
    /// [`Stm::release_current`].
    pub fn on_shutdown(self) {
        self.stm.release_current();
        self.manager.shutdown();
        put_current(&self.ctx);
        info!(context = self.ctx.id(), stats = ?self.manager.stats(), "runtime.shutdown");
    }
}
