#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mnemo::config::{LogKind, MnemoConfig, PcmConfig, StmConfig};
use mnemo::metrics::CounterStats;
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::stm::TxAccess;
use mnemo::{PAddr, Result, Runtime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DATA_FLAGS: u64 = 0x4441_5441;

fn config(kind: LogKind, sync_truncation: bool, likelihood_evicted_cacheline: u32) -> MnemoConfig {
    MnemoConfig {
        pcm: PcmConfig {
            region_bytes: 256 * PAGE_SIZE,
            log_pool_slots: 8,
            log_slot_words: 1024,
            likelihood_evicted_cacheline,
            ..PcmConfig::default()
        },
        stm: StmConfig {
            lock_array_log_size: 10,
            log_type: kind,
            sync_truncation,
            truncation_interval_ms: 600_000,
            ..StmConfig::default()
        },
    }
}

fn segment(runtime: &Runtime, words: u64) -> Result<PAddr> {
    Ok(runtime
        .context()
        .region()
        .alloc_region(None, words * 8, DATA_FLAGS)?
        .start)
}

#[test]
fn committed_values_survive_a_crash() -> Result<()> {
    for kind in [LogKind::Base, LogKind::Tornbit] {
        let runtime =
            Runtime::on_first_use(config(kind, true, 0), Arc::new(CounterStats::default()))?;
        let data = segment(&runtime, 32)?;
        for i in 0..20u64 {
            runtime.run(|tx| tx.store(data.word(i), i * 3 + 1))?;
        }
        runtime.run(|tx| tx.store_bytes(data.word(20), b"tail"))?;
        let report = runtime.crash(None, false)?.expect("crash ran");
        assert!(report.storesets >= 1);

        let restarted = runtime.restart_from_crash()?;
        assert_eq!(restarted.recovered(), 0, "{kind:?}: logs were truncated at commit");
        assert!(restarted.context().region().find_region(data)?.is_some());
        for i in 0..20u64 {
            assert_eq!(restarted.run(|tx| tx.load(data.word(i)))?, i * 3 + 1, "{kind:?}");
        }
        let mut tail = [0u8; 4];
        restarted.run(|tx| tx.load_bytes(data.word(20), &mut tail))?;
        assert_eq!(&tail, b"tail");
        restarted.on_shutdown();
        runtime.on_shutdown();
    }
    Ok(())
}

#[test]
fn untruncated_records_are_replayed_on_restart() -> Result<()> {
    for kind in [LogKind::Base, LogKind::Tornbit] {
        let runtime =
            Runtime::on_first_use(config(kind, false, 0), Arc::new(CounterStats::default()))?;
        let data = segment(&runtime, 8)?;
        for i in 0..10u64 {
            runtime.run(|tx| {
                tx.store(data, i)?;
                tx.store(data.word(1 + i % 4), 100 + i)
            })?;
        }
        assert_eq!(runtime.manager().stats().truncation_passes, 0);
        // the descriptor is still cached, so its log was never freed
        runtime.crash(None, false)?;

        let restarted = runtime.restart_from_crash()?;
        assert_eq!(restarted.recovered(), 10, "{kind:?}");
        assert_eq!(restarted.run(|tx| tx.load(data))?, 9);
        for w in 1..=4u64 {
            let want = 100 + (6..10).find(|i| 1 + i % 4 == w).unwrap_or(0);
            assert_eq!(restarted.run(|tx| tx.load(data.word(w)))?, want, "{kind:?} word {w}");
        }
        restarted.on_shutdown();
        runtime.on_shutdown();
    }
    Ok(())
}

#[test]
fn crash_during_concurrent_transfers_keeps_the_total() -> Result<()> {
    const ACCOUNTS: u64 = 32;
    const INITIAL: u64 = 500;
    for (kind, sync) in [(LogKind::Base, true), (LogKind::Tornbit, false)] {
        let runtime = Runtime::on_first_use(
            config(kind, sync, PcmConfig::default().likelihood_evicted_cacheline),
            Arc::new(CounterStats::default()),
        )?;
        let accounts = segment(&runtime, ACCOUNTS)?;
        runtime.run(|tx| {
            for i in 0..ACCOUNTS {
                tx.store(accounts.word(i), INITIAL)?;
            }
            Ok(())
        })?;

        let done = AtomicU64::new(0);
        let stop = AtomicBool::new(false);
        thread::scope(|scope| -> Result<()> {
            let workers: Vec<_> = (0..3u64)
                .map(|t| {
                    let (runtime, done, stop) = (&runtime, &done, &stop);
                    scope.spawn(move || -> Result<()> {
                        let mut rng = ChaCha8Rng::seed_from_u64(t * 31 + 7);
                        while !stop.load(Ordering::Acquire) {
                            let from = rng.gen_range(0..ACCOUNTS);
                            let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                            let amount = rng.gen_range(1..=40);
                            runtime.run(|tx| {
                                let a = tx.load(accounts.word(from))?;
                                if a < amount {
                                    return Ok(());
                                }
                                let b = tx.load(accounts.word(to))?;
                                tx.store(accounts.word(from), a - amount)?;
                                tx.store(accounts.word(to), b + amount)
                            })?;
                            done.fetch_add(1, Ordering::AcqRel);
                        }
                        runtime.stm().release_current();
                        Ok(())
                    })
                })
                .collect();
            while done.load(Ordering::Acquire) < 300 {
                thread::sleep(Duration::from_millis(1));
            }
            runtime.crash(None, false)?;
            stop.store(true, Ordering::Release);
            workers
                .into_iter()
                .try_for_each(|w| w.join().expect("transfer worker panicked"))
        })?;

        let restarted = runtime.restart_from_crash()?;
        let sum = restarted.run(|tx| {
            let mut sum = 0;
            for i in 0..ACCOUNTS {
                sum += tx.load(accounts.word(i))?;
            }
            Ok(sum)
        })?;
        assert_eq!(sum, ACCOUNTS * INITIAL, "{kind:?}");
        restarted.on_shutdown();
        runtime.on_shutdown();
    }
    Ok(())
}
