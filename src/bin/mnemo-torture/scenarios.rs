//! Crash-injection scenarios. Each returns a serializable summary; a
//! non-zero `violations` (or an inconsistent sum) means the emulator or the
//! engine lost a durability guarantee.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mnemo::config::{LogKind, MnemoConfig, PcmConfig, TOTAL_OUTCOMES};
use mnemo::log::{BaseLog, LogSlot, PhysicalLog, TornbitLog};
use mnemo::metrics::CounterStats;
use mnemo::pcm::{PcmContext, Storeset};
use mnemo::primitives::bytes::WORD_SIZE;
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::stm::TxAccess;
use mnemo::{MnemoError, PAddr, Result, Runtime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ui::Ui;

const SCENARIO_REGION: u64 = 64 * PAGE_SIZE;
const DATA_FLAGS: u64 = 0x4441_5441;
const STORES_PER_ROUND: usize = 256;
const FLUSH_PROBABILITY: f64 = 0.25;
const LOG_WORDS: u64 = 1024;
const ACCOUNTS: u64 = 64;
const INITIAL_BALANCE: u64 = 1_000;

/// Knobs shared by every scenario.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub seed: u64,
    pub threads: usize,
    pub iterations: u64,
}

fn scenario_pcm(config: &MnemoConfig) -> PcmConfig {
    PcmConfig {
        region_bytes: SCENARIO_REGION,
        ..config.pcm.clone()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RollbackSummary {
    pub iterations: u64,
    pub stores: u64,
    pub flushed_words: u64,
    pub rolled_back_words: u64,
    pub evicted_words: u64,
    pub violations: u64,
}

/// Random write-back stores, some flushed, then a crash. Flushed words must
/// keep their value; the others must hold either the value before the round
/// or the last value stored.
pub fn crash(config: &MnemoConfig, opts: &Options, ui: &Ui) -> Result<RollbackSummary> {
    let pcm = scenario_pcm(config);
    let line_log = pcm.cacheline_size_log;
    let ctx = PcmContext::new(pcm, None)?;
    let mut set = Storeset::new(&ctx);
    let segment = ctx
        .region()
        .alloc_region(None, 16 * PAGE_SIZE, DATA_FLAGS)?;
    let words = segment.len / WORD_SIZE;
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let mut summary = RollbackSummary {
        iterations: opts.iterations,
        ..RollbackSummary::default()
    };

    let bar = ui.progress("crash rounds", opts.iterations);
    for round in 0..opts.iterations {
        let mut durable: FxHashMap<PAddr, u64> = FxHashMap::default();
        let mut latest: FxHashMap<PAddr, u64> = FxHashMap::default();
        for _ in 0..STORES_PER_ROUND {
            let addr = segment.start.word(rng.gen_range(0..words));
            if !durable.contains_key(&addr) {
                durable.insert(addr, set.load(addr)?);
            }
            let value = rng.gen::<u64>() | 1;
            set.wb_store(addr, value)?;
            latest.insert(addr, value);
            summary.stores += 1;
            if rng.gen_bool(FLUSH_PROBABILITY) {
                set.wb_flush(addr)?;
                let line = addr.align_down(line_log);
                for (a, v) in &latest {
                    if a.align_down(line_log) == line {
                        durable.insert(*a, *v);
                    }
                }
            }
        }
        ctx.trigger_crash(Some(&set), false)?;
        for (addr, value) in &latest {
            let before = durable.get(addr).copied().unwrap_or(0);
            let found = set.load(*addr)?;
            if before == *value && found == *value {
                summary.flushed_words += 1;
            } else if found == before {
                summary.rolled_back_words += 1;
            } else if found == *value {
                summary.evicted_words += 1;
            } else {
                summary.violations += 1;
                warn!(round, addr = addr.0, found, before, value, "torture.crash.violation");
            }
        }
        ctx.trigger_crash_reset();
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(summary)
}

#[derive(Debug, Serialize)]
pub struct CdfBucket {
    pub words: usize,
    pub expected: f64,
    pub observed: f64,
}

#[derive(Debug, Serialize)]
pub struct CdfSummary {
    pub iterations: u64,
    pub words_per_line: usize,
    pub buckets: Vec<CdfBucket>,
    pub max_deviation: f64,
}

/// Weights spreading the outcomes evenly over `0..=words` surviving words.
pub fn uniform_cdf(words: usize) -> Vec<u32> {
    let share = TOTAL_OUTCOMES / (words as u32 + 1);
    let mut weights = vec![share; words + 1];
    weights[words] += TOTAL_OUTCOMES - share * (words as u32 + 1);
    weights
}

/// Dirties one full line per round and crashes with eviction forced, then
/// histograms how many of its words survived.
pub fn cdf(config: &MnemoConfig, opts: &Options, uniform: bool, ui: &Ui) -> Result<CdfSummary> {
    let mut pcm = scenario_pcm(config);
    pcm.likelihood_evicted_cacheline = TOTAL_OUTCOMES;
    let n = pcm.words_per_line();
    if uniform {
        pcm.crash_cdf = uniform_cdf(n);
    }
    let weights = pcm.crash_cdf.clone();
    let ctx = PcmContext::new(pcm, None)?;
    let mut set = Storeset::new(&ctx);
    let line = ctx.region().alloc_region(None, PAGE_SIZE, DATA_FLAGS)?.start;

    let mut histogram = vec![0u64; n + 1];
    let bar = ui.progress("partial crashes", opts.iterations);
    for round in 0..opts.iterations {
        let value = round + 1;
        for w in 0..n as u64 {
            set.wb_store(line.word(w), value)?;
        }
        ctx.trigger_crash(Some(&set), false)?;
        let mut survived = 0;
        for w in 0..n as u64 {
            if set.load(line.word(w))? == value {
                survived += 1;
            }
        }
        histogram[survived] += 1;
        ctx.trigger_crash_reset();
        bar.inc(1);
    }
    bar.finish_and_clear();

    let rounds = opts.iterations.max(1) as f64;
    let buckets: Vec<CdfBucket> = histogram
        .iter()
        .zip(&weights)
        .enumerate()
        .map(|(words, (&count, &weight))| CdfBucket {
            words,
            expected: f64::from(weight) / f64::from(TOTAL_OUTCOMES),
            observed: count as f64 / rounds,
        })
        .collect();
    let max_deviation = buckets
        .iter()
        .map(|b| (b.expected - b.observed).abs())
        .fold(0.0, f64::max);
    Ok(CdfSummary {
        iterations: opts.iterations,
        words_per_line: n,
        buckets,
        max_deviation,
    })
}

#[derive(Debug, Default, Serialize)]
pub struct LogRun {
    pub kind: String,
    pub iterations: u64,
    pub flushed_records: u64,
    pub extra_words: u64,
    pub torn_recoveries: u64,
    pub violations: u64,
}

#[derive(Debug, Serialize)]
pub struct LogSummary {
    pub runs: Vec<LogRun>,
}

impl LogSummary {
    pub fn violations(&self) -> u64 {
        self.runs.iter().map(|r| r.violations).sum()
    }
}

fn open_log(
    kind: LogKind,
    set: &mut Storeset,
    slot: LogSlot,
    format: bool,
) -> Result<Box<dyn PhysicalLog>> {
    let mut log: Box<dyn PhysicalLog> = match kind {
        LogKind::Base => {
            if format {
                BaseLog::format(set, &slot)?;
            }
            Box::new(BaseLog::open(set, slot)?)
        }
        LogKind::Tornbit => {
            if format {
                TornbitLog::format(set, &slot)?;
            }
            Box::new(TornbitLog::open(set, slot)?)
        }
    };
    log.check_consistency()?;
    Ok(log)
}

/// Flushed records followed by an unflushed tail, then a crash and a
/// restart over the crash image. Every flushed record must read back and
/// whatever follows must be a prefix of the unflushed tail.
pub fn log(
    config: &MnemoConfig,
    opts: &Options,
    only: Option<LogKind>,
    ui: &Ui,
) -> Result<LogSummary> {
    let kinds = match only {
        Some(kind) => vec![kind],
        None => vec![LogKind::Base, LogKind::Tornbit],
    };
    let pcm = scenario_pcm(config);
    let slot = LogSlot {
        index: 0,
        nvmd: PAddr(PAGE_SIZE),
        data: PAddr(2 * PAGE_SIZE),
        words: LOG_WORDS,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let mut runs = Vec::new();
    for kind in kinds {
        let mut run = LogRun {
            kind: format!("{kind:?}").to_lowercase(),
            iterations: opts.iterations,
            ..LogRun::default()
        };
        let bar = ui.progress(&format!("{} log rounds", run.kind), opts.iterations);
        for round in 0..opts.iterations {
            let ctx = PcmContext::new(pcm.clone(), None)?;
            let mut set = Storeset::new(&ctx);
            let mut log = open_log(kind, &mut set, slot, true)?;

            let mut records = Vec::new();
            for _ in 0..rng.gen_range(1..=8) {
                let record: Vec<u64> = (0..rng.gen_range(1..=12)).map(|_| rng.gen()).collect();
                for &v in &record {
                    log.write(&mut set, v)?;
                }
                log.flush(&mut set)?;
                records.push(record);
            }
            let tail: Vec<u64> = (0..rng.gen_range(0..=40)).map(|_| rng.gen()).collect();
            for &v in &tail {
                log.write(&mut set, v)?;
            }
            ctx.trigger_crash(Some(&set), false)?;
            drop(log);
            drop(set);

            let image = ctx
                .crash_image()
                .ok_or(MnemoError::Invalid("crash left no image"))?;
            let restarted = PcmContext::new(pcm.clone(), Some(image))?;
            let mut set = Storeset::new(&restarted);
            let mut reader = open_log(kind, &mut set, slot, false)?;
            let mut intact = true;
            'records: for record in &records {
                for &expected in record {
                    match reader.read() {
                        Ok(found) if found == expected => {}
                        Ok(_) | Err(MnemoError::NoData) => {
                            intact = false;
                            break 'records;
                        }
                        Err(err) => return Err(err),
                    }
                }
                reader.next_chunk();
            }
            if !intact {
                run.violations += 1;
                warn!(round, kind = %run.kind, "torture.log.flushed_record_lost");
                bar.inc(1);
                continue;
            }
            run.flushed_records += records.len() as u64;
            let mut extra = 0usize;
            loop {
                match reader.read() {
                    Ok(found) => {
                        if tail.get(extra) != Some(&found) {
                            run.violations += 1;
                            warn!(round, kind = %run.kind, extra, "torture.log.garbage_after_tail");
                            break;
                        }
                        extra += 1;
                    }
                    Err(MnemoError::NoData) => break,
                    Err(err) => return Err(err),
                }
            }
            if extra > 0 {
                run.torn_recoveries += 1;
            }
            run.extra_words += extra as u64;
            bar.inc(1);
        }
        bar.finish_and_clear();
        runs.push(run);
    }
    Ok(LogSummary { runs })
}

#[derive(Debug, Serialize)]
pub struct StmSummary {
    pub threads: usize,
    pub transfers_before_crash: u64,
    pub transfers_total: u64,
    pub restarts: u64,
    pub recovered_units: u64,
    pub crash_evicted_lines: usize,
    pub crash_restored_bytes: usize,
    pub sum: u64,
    pub expected: u64,
    pub consistent: bool,
}

/// Concurrent transfers between accounts, a crash in the middle, a restart
/// over the crash image and a check that the balances still add up.
pub fn stm(config: &MnemoConfig, opts: &Options, ui: &Ui) -> Result<StmSummary> {
    let stats = Arc::new(CounterStats::default());
    let runtime = Runtime::on_first_use(config.clone(), stats.clone())?;
    let accounts = runtime
        .context()
        .region()
        .alloc_region(None, ACCOUNTS * WORD_SIZE, DATA_FLAGS)?
        .start;
    runtime.run(|tx| {
        for i in 0..ACCOUNTS {
            tx.store(accounts.word(i), INITIAL_BALANCE)?;
        }
        Ok(())
    })?;

    let threads = opts.threads.max(1);
    let crash_after = opts.iterations * threads as u64 / 2;
    let transfers = AtomicU64::new(0);
    let finished = AtomicU64::new(0);
    let stop = AtomicBool::new(false);
    let bar = ui.progress("transfers", opts.iterations * threads as u64);

    let (report, before_crash) = thread::scope(|scope| -> Result<_> {
        let mut workers = Vec::with_capacity(threads);
        for t in 0..threads {
            let (runtime, transfers, finished, stop, bar) =
                (&runtime, &transfers, &finished, &stop, &bar);
            let seed = opts.seed ^ (t as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            workers.push(scope.spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut outcome = Ok(());
                for _ in 0..opts.iterations {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let from = rng.gen_range(0..ACCOUNTS);
                    let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                    let amount = rng.gen_range(1..=50);
                    let moved = runtime.run(|tx| {
                        let a = tx.load(accounts.word(from))?;
                        if a < amount {
                            return Ok(false);
                        }
                        let b = tx.load(accounts.word(to))?;
                        tx.store(accounts.word(from), a - amount)?;
                        tx.store(accounts.word(to), b + amount)?;
                        Ok(true)
                    });
                    match moved {
                        Ok(_) => {
                            transfers.fetch_add(1, Ordering::AcqRel);
                            bar.inc(1);
                        }
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                runtime.stm().release_current();
                finished.fetch_add(1, Ordering::AcqRel);
                outcome
            }));
        }

        while transfers.load(Ordering::Acquire) < crash_after
            && finished.load(Ordering::Acquire) < threads as u64
        {
            thread::sleep(Duration::from_millis(1));
        }
        let before_crash = transfers.load(Ordering::Acquire);
        let report = runtime.crash(None, false)?;
        debug!(before_crash, "torture.stm.crashed");
        stop.store(true, Ordering::Release);

        for worker in workers {
            worker
                .join()
                .map_err(|_| MnemoError::Invalid("transfer worker panicked"))??;
        }
        Ok((report, before_crash))
    })?;
    bar.finish_and_clear();

    let restarted = runtime.restart_from_crash()?;
    let recovered_units = restarted.recovered();
    if restarted.context().region().find_region(accounts)?.is_none() {
        return Err(MnemoError::Corruption("account segment missing after restart"));
    }
    let sum = restarted.run(|tx| {
        let mut total = 0u64;
        for i in 0..ACCOUNTS {
            total += tx.load(accounts.word(i))?;
        }
        Ok(total)
    })?;
    let expected = ACCOUNTS * INITIAL_BALANCE;
    restarted.on_shutdown();
    runtime.on_shutdown();

    let snapshot = stats.snapshot();
    Ok(StmSummary {
        threads,
        transfers_before_crash: before_crash,
        transfers_total: transfers.load(Ordering::Acquire),
        restarts: snapshot.total_restarts(),
        recovered_units,
        crash_evicted_lines: report.as_ref().map_or(0, |r| r.evicted_lines),
        crash_restored_bytes: report.as_ref().map_or(0, |r| r.restored_bytes),
        sum,
        expected,
        consistent: sum == expected,
    })
}
