#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mnemo::config::{ContentionPolicy, Isolation, LogKind, MnemoConfig, PcmConfig, StmConfig};
use mnemo::metrics::CounterStats;
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::stm::TxAccess;
use mnemo::types::RestartReason;
use mnemo::{MnemoError, PAddr, Result, Runtime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const ACCOUNTS: u64 = 16;
const INITIAL: u64 = 100;
const DATA_FLAGS: u64 = 0x4143_4354;

fn config(stm: StmConfig) -> MnemoConfig {
    MnemoConfig {
        pcm: PcmConfig {
            region_bytes: 256 * PAGE_SIZE,
            log_pool_slots: 8,
            log_slot_words: 1024,
            likelihood_evicted_cacheline: 0,
            ..PcmConfig::default()
        },
        stm: StmConfig {
            lock_array_log_size: 10,
            ..stm
        },
    }
}

fn start(stm: StmConfig) -> Result<(Runtime, Arc<CounterStats>, PAddr)> {
    let stats = Arc::new(CounterStats::default());
    let runtime = Runtime::on_first_use(config(stm), stats.clone())?;
    let accounts = runtime
        .context()
        .region()
        .alloc_region(None, ACCOUNTS * 8, DATA_FLAGS)?
        .start;
    runtime.run(|tx| {
        for i in 0..ACCOUNTS {
            tx.store(accounts.word(i), INITIAL)?;
        }
        Ok(())
    })?;
    Ok((runtime, stats, accounts))
}

fn total(runtime: &Runtime, accounts: PAddr) -> Result<u64> {
    runtime.run(|tx| {
        let mut sum = 0;
        for i in 0..ACCOUNTS {
            sum += tx.load(accounts.word(i))?;
        }
        Ok(sum)
    })
}

fn transfers(runtime: &Runtime, accounts: PAddr, threads: usize, per_thread: u64) -> Result<()> {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(t as u64 + 1);
                    for _ in 0..per_thread {
                        let from = rng.gen_range(0..ACCOUNTS);
                        let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                        let amount = rng.gen_range(1..=20);
                        runtime.run(|tx| {
                            let a = tx.load(accounts.word(from))?;
                            if a < amount {
                                return Ok(());
                            }
                            let b = tx.load(accounts.word(to))?;
                            tx.store(accounts.word(from), a - amount)?;
                            tx.store(accounts.word(to), b + amount)
                        })?;
                    }
                    runtime.stm().release_current();
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .try_for_each(|w| w.join().expect("transfer worker panicked"))
    })
}

#[test]
fn concurrent_transfers_preserve_the_total() -> Result<()> {
    let setups = [
        (ContentionPolicy::Suicide, LogKind::Base, true),
        (ContentionPolicy::Backoff, LogKind::Tornbit, false),
        (ContentionPolicy::Delay, LogKind::Base, false),
    ];
    for (policy, kind, sync) in setups {
        let (runtime, stats, accounts) = start(StmConfig {
            contention_manager: policy,
            log_type: kind,
            sync_truncation: sync,
            ..StmConfig::default()
        })?;
        transfers(&runtime, accounts, 4, 250)?;
        assert_eq!(total(&runtime, accounts)?, ACCOUNTS * INITIAL, "{policy:?}/{kind:?}");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.commits, 1 + 4 * 250 + 1, "{policy:?}/{kind:?}");
        assert_eq!(snapshot.aborts, 0);
        if !sync {
            assert!(runtime.manager().stats().truncation_passes > 0);
        }
        runtime.on_shutdown();
    }
    Ok(())
}

#[test]
fn private_lock_tables_when_isolation_is_off() -> Result<()> {
    let (runtime, stats, accounts) = start(StmConfig {
        isolation: Isolation::None,
        ..StmConfig::default()
    })?;
    for _ in 0..100 {
        runtime.run(|tx| {
            let v = tx.load(accounts)?;
            tx.store(accounts, v + 1)
        })?;
    }
    assert_eq!(runtime.run(|tx| tx.load(accounts))?, INITIAL + 100);
    assert_eq!(stats.snapshot().total_restarts(), 0);
    runtime.on_shutdown();
    Ok(())
}

#[test]
fn user_abort_discards_every_write() -> Result<()> {
    let (runtime, stats, accounts) = start(StmConfig::default())?;
    let undone = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&undone);
    let outcome: Result<()> = runtime.run(|tx| {
        tx.store(accounts, 0)?;
        tx.store(accounts.word(1), 0)?;
        let flag = Arc::clone(&flag);
        tx.on_abort(move || flag.store(true, Ordering::Release));
        Err(MnemoError::UserAbort)
    });
    assert!(matches!(outcome, Err(MnemoError::UserAbort)));
    assert!(undone.load(Ordering::Acquire));
    assert_eq!(total(&runtime, accounts)?, ACCOUNTS * INITIAL);
    assert_eq!(stats.snapshot().aborts, 1);
    runtime.on_shutdown();
    Ok(())
}

#[test]
fn user_retry_is_counted_and_rerun() -> Result<()> {
    let (runtime, stats, accounts) = start(StmConfig::default())?;
    let mut attempts = 0;
    runtime.run(|tx| {
        attempts += 1;
        tx.store(accounts, 7)?;
        if attempts < 3 {
            return tx.retry();
        }
        Ok(())
    })?;
    assert_eq!(attempts, 3);
    assert_eq!(runtime.run(|tx| tx.load(accounts))?, 7);
    assert_eq!(stats.snapshot().restarts_for(RestartReason::UserRetry), 2);
    runtime.on_shutdown();
    Ok(())
}

#[test]
fn byte_stores_commit_as_one_unit() -> Result<()> {
    let (runtime, _stats, accounts) = start(StmConfig::default())?;
    let name = b"persistent record";
    runtime.run(|tx| tx.store_bytes(accounts.add(3), name))?;
    let mut out = vec![0u8; name.len()];
    runtime.run(|tx| tx.load_bytes(accounts.add(3), &mut out))?;
    assert_eq!(&out, name);
    // bytes before the record keep the initial balance
    assert_eq!(runtime.run(|tx| tx.load(accounts))? & 0xFF_FFFF, INITIAL);
    runtime.on_shutdown();
    Ok(())
}
