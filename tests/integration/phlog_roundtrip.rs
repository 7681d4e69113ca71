#![allow(missing_docs)]

use std::sync::Arc;

use mnemo::config::{no_partial_cdf, PcmConfig, TOTAL_OUTCOMES};
use mnemo::log::{BaseLog, LogSlot, PhysicalLog, TornbitLog, CHUNK_WORDS};
use mnemo::pcm::{PcmContext, Storeset};
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::{MnemoError, PAddr, Result};

#[derive(Clone, Copy, Debug)]
enum Kind {
    Base,
    Tornbit,
}

const KINDS: [Kind; 2] = [Kind::Base, Kind::Tornbit];

fn slot(words: u64) -> LogSlot {
    LogSlot {
        index: 0,
        nvmd: PAddr(PAGE_SIZE),
        data: PAddr(2 * PAGE_SIZE),
        words,
    }
}

fn context(likelihood_evicted_cacheline: u32) -> Result<Arc<PcmContext>> {
    PcmContext::new(
        PcmConfig {
            region_bytes: 8 * PAGE_SIZE,
            likelihood_evicted_cacheline,
            crash_cdf: no_partial_cdf(8),
            ..PcmConfig::default()
        },
        None,
    )
}

fn format(kind: Kind, set: &mut Storeset, slot: &LogSlot) -> Result<()> {
    match kind {
        Kind::Base => BaseLog::format(set, slot),
        Kind::Tornbit => TornbitLog::format(set, slot),
    }
}

fn open(kind: Kind, set: &Storeset, slot: LogSlot) -> Result<Box<dyn PhysicalLog>> {
    let mut log: Box<dyn PhysicalLog> = match kind {
        Kind::Base => Box::new(BaseLog::open(set, slot)?),
        Kind::Tornbit => Box::new(TornbitLog::open(set, slot)?),
    };
    log.check_consistency()?;
    Ok(log)
}

fn values(n: u64, salt: u64) -> Vec<u64> {
    (0..n)
        .map(|i| (i + salt).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ salt)
        .collect()
}

#[test]
fn flushed_values_read_back_after_reopen() -> Result<()> {
    for kind in KINDS {
        let ctx = context(0)?;
        let mut set = Storeset::new(&ctx);
        let slot = slot(128);
        format(kind, &mut set, &slot)?;
        let mut log = open(kind, &set, slot)?;
        let written = values(20, 7);
        for &v in &written {
            log.write(&mut set, v)?;
        }
        log.flush(&mut set)?;
        let tail = log.stats().tail;
        assert_eq!(tail % CHUNK_WORDS, 0, "{kind:?}");

        let mut reader = open(kind, &set, slot)?;
        assert_eq!(reader.stats().stable_tail, tail, "{kind:?}");
        let read = written
            .iter()
            .map(|_| reader.read())
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(read, written, "{kind:?}");
        reader.next_chunk();
        assert!(!reader.stable_exists(), "{kind:?}");
        assert!(matches!(reader.read(), Err(MnemoError::NoData)), "{kind:?}");
    }
    Ok(())
}

#[test]
fn twenty_words_take_three_chunks() -> Result<()> {
    for kind in KINDS {
        let ctx = context(0)?;
        let mut set = Storeset::new(&ctx);
        let slot = slot(128);
        format(kind, &mut set, &slot)?;
        let mut log = open(kind, &set, slot)?;
        for (i, &v) in values(20, 3).iter().enumerate() {
            log.write(&mut set, v)?;
            let emitted = log.stats().tail / CHUNK_WORDS;
            assert_eq!(emitted, (i as u64 + 1) / CHUNK_WORDS, "{kind:?} after {i}");
        }
        log.flush(&mut set)?;
        assert_eq!(log.stats().tail, 3 * CHUNK_WORDS, "{kind:?}");
        assert_eq!(log.stats().chunk_writes, 3, "{kind:?}");
    }
    Ok(())
}

#[test]
fn round_trip_for_assorted_lengths() -> Result<()> {
    for kind in KINDS {
        for n in [0u64, 1, 7, 8, 9, 16, 17, 40] {
            let ctx = context(0)?;
            let mut set = Storeset::new(&ctx);
            let slot = slot(128);
            format(kind, &mut set, &slot)?;
            let mut log = open(kind, &set, slot)?;
            let written = values(n, n);
            for &v in &written {
                log.write(&mut set, v)?;
            }
            log.flush(&mut set)?;

            let mut reader = open(kind, &set, slot)?;
            let read = written
                .iter()
                .map(|_| reader.read())
                .collect::<Result<Vec<_>>>()?;
            assert_eq!(read, written, "{kind:?} n={n}");
            if n == 0 {
                assert!(matches!(reader.read(), Err(MnemoError::NoData)), "{kind:?}");
            }
        }
    }
    Ok(())
}

#[test]
fn unflushed_chunks_do_not_survive_a_crash() -> Result<()> {
    for kind in KINDS {
        let ctx = context(0)?;
        let mut set = Storeset::new(&ctx);
        let slot = slot(64);
        format(kind, &mut set, &slot)?;
        let mut log = open(kind, &set, slot)?;
        for v in values(3, 1) {
            log.write(&mut set, v)?;
        }
        log.flush(&mut set)?;
        for v in values(20, 2) {
            log.write(&mut set, v)?;
        }
        assert!(log.stats().chunk_writes > 1);
        ctx.trigger_crash(Some(&set), false)?;

        let reader = open(kind, &set, slot)?;
        assert_eq!(reader.stats().stable_tail, CHUNK_WORDS, "{kind:?}");
    }
    Ok(())
}

#[test]
fn base_tail_hides_evicted_chunks() -> Result<()> {
    let ctx = context(TOTAL_OUTCOMES)?;
    let mut set = Storeset::new(&ctx);
    let slot = slot(64);
    BaseLog::format(&mut set, &slot)?;
    let mut log = open(Kind::Base, &set, slot)?;
    log.write(&mut set, 11)?;
    log.flush(&mut set)?;
    for v in 0..16u64 {
        log.write(&mut set, v)?;
    }
    let report = ctx.trigger_crash(Some(&set), false)?.expect("crash ran");
    assert!(report.evicted_lines >= 2);

    let mut reader = open(Kind::Base, &set, slot)?;
    assert_eq!(reader.stats().stable_tail, CHUNK_WORDS);
    assert_eq!(reader.read()?, 11);
    Ok(())
}

#[test]
fn base_log_holds_one_word_less_than_its_capacity() -> Result<()> {
    let ctx = context(0)?;
    let mut set = Storeset::new(&ctx);
    let slot = slot(64);
    BaseLog::format(&mut set, &slot)?;
    let mut log = BaseLog::open(&set, slot)?;
    log.check_consistency()?;
    for v in 0..63u64 {
        log.write(&mut set, v)?;
    }
    assert!(matches!(log.write(&mut set, 63), Err(MnemoError::LogFull)));
    assert!(matches!(log.flush(&mut set), Err(MnemoError::LogFull)));
    assert_eq!(log.stats().tail, 56);

    log.rewind_writer();
    assert_eq!(log.stats().tail, 0);
    for v in [5u64, 6, 7] {
        log.write(&mut set, v)?;
    }
    log.flush(&mut set)?;
    assert_eq!(log.stats().free_words, 48);
    assert_eq!(
        [log.read()?, log.read()?, log.read()?],
        [5, 6, 7],
        "rewound writer reused the dropped chunks"
    );
    Ok(())
}

#[test]
fn checkpoint_restores_the_reader() -> Result<()> {
    let ctx = context(0)?;
    let mut set = Storeset::new(&ctx);
    let slot = slot(64);
    BaseLog::format(&mut set, &slot)?;
    let mut log = open(Kind::Base, &set, slot)?;
    for v in 100..110u64 {
        log.write(&mut set, v)?;
    }
    log.flush(&mut set)?;
    for want in 100..103u64 {
        assert_eq!(log.read()?, want);
    }
    let mark = log.checkpoint()?;
    assert_eq!(log.read()?, 103);
    assert_eq!(log.read()?, 104);
    log.restore(mark);
    assert_eq!(log.read()?, 103);
    Ok(())
}

#[test]
fn tornbit_checkpoint_needs_a_value_boundary() -> Result<()> {
    let ctx = context(0)?;
    let mut set = Storeset::new(&ctx);
    let slot = slot(64);
    TornbitLog::format(&mut set, &slot)?;
    let mut log = open(Kind::Tornbit, &set, slot)?;
    for v in values(4, 3) {
        log.write(&mut set, v)?;
    }
    log.flush(&mut set)?;
    assert_eq!(log.checkpoint()?, 0);
    log.read()?;
    assert!(matches!(log.checkpoint(), Err(MnemoError::Invalid(_))));
    log.next_chunk();
    assert_eq!(log.checkpoint()?, CHUNK_WORDS);
    Ok(())
}

#[test]
fn truncate_sync_empties_the_log_for_the_next_opener() -> Result<()> {
    for kind in KINDS {
        let ctx = context(0)?;
        let mut set = Storeset::new(&ctx);
        let slot = slot(64);
        format(kind, &mut set, &slot)?;
        let mut log = open(kind, &set, slot)?;
        for v in values(12, 9) {
            log.write(&mut set, v)?;
        }
        log.flush(&mut set)?;
        log.truncate_sync(&mut set)?;
        let stats = log.stats();
        assert_eq!(stats.head, stats.tail, "{kind:?}");
        assert_eq!(stats.free_words, 56, "{kind:?}");

        let mut reader = open(kind, &set, slot)?;
        assert!(!reader.stable_exists(), "{kind:?}");
        assert!(matches!(reader.read(), Err(MnemoError::NoData)), "{kind:?}");
    }
    Ok(())
}

#[test]
fn truncate_async_keeps_what_the_reader_has_not_reached() -> Result<()> {
    for kind in KINDS {
        let ctx = context(0)?;
        let mut set = Storeset::new(&ctx);
        let slot = slot(64);
        format(kind, &mut set, &slot)?;
        let mut log = open(kind, &set, slot)?;
        let first = values(3, 4);
        let second = values(3, 5);
        for &v in &first {
            log.write(&mut set, v)?;
        }
        log.flush(&mut set)?;
        for &v in &second {
            log.write(&mut set, v)?;
        }
        log.flush(&mut set)?;

        for _ in &first {
            log.read()?;
        }
        assert!(matches!(
            log.truncate_async(&mut set),
            Err(MnemoError::Invalid(_))
        ));
        log.next_chunk();
        log.truncate_async(&mut set)?;

        let mut reader = open(kind, &set, slot)?;
        assert_eq!(reader.stats().head, CHUNK_WORDS, "{kind:?}");
        let read = second
            .iter()
            .map(|_| reader.read())
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(read, second, "{kind:?}");
    }
    Ok(())
}
