#![allow(missing_docs)]

use std::sync::Arc;

use mnemo::config::{exact_cdf, no_partial_cdf, PcmConfig, TOTAL_OUTCOMES};
use mnemo::log::{LogSlot, PhysicalLog, TornbitLog, CHUNK_WORDS};
use mnemo::pcm::{PcmContext, Storeset};
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::{MnemoError, PAddr, Result};

const SLOT: LogSlot = LogSlot {
    index: 3,
    nvmd: PAddr(PAGE_SIZE),
    data: PAddr(2 * PAGE_SIZE),
    words: 64,
};

fn config(crash_cdf: Vec<u32>, likelihood_evicted_cacheline: u32) -> PcmConfig {
    PcmConfig {
        region_bytes: 8 * PAGE_SIZE,
        crash_cdf,
        likelihood_evicted_cacheline,
        ..PcmConfig::default()
    }
}

fn reopen(set: &Storeset) -> Result<TornbitLog> {
    let mut log = TornbitLog::open(set, SLOT)?;
    log.check_consistency()?;
    Ok(log)
}

fn drain(log: &mut TornbitLog) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    loop {
        match log.read() {
            Ok(v) => out.push(v),
            Err(MnemoError::NoData) => return Ok(out),
            Err(err) => return Err(err),
        }
    }
}

#[test]
fn records_survive_many_wraps() -> Result<()> {
    let ctx = PcmContext::new(config(no_partial_cdf(8), 0), None)?;
    let mut set = Storeset::new(&ctx);
    TornbitLog::format(&mut set, &SLOT)?;
    let mut writer = reopen(&set)?;

    for round in 0..40u64 {
        let len = 1 + round % 12;
        let record: Vec<u64> = (0..len).map(|i| u64::MAX - round * 1000 - i).collect();
        for &v in &record {
            writer.write(&mut set, v)?;
        }
        writer.flush(&mut set)?;

        let mut reader = reopen(&set)?;
        let read = record
            .iter()
            .map(|_| reader.read())
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(read, record, "round {round}");
        reader.next_chunk();
        assert!(!reader.stable_exists(), "round {round}");

        writer.truncate_sync(&mut set)?;
    }
    assert!(writer.stats().chunk_writes > 2 * SLOT.words / CHUNK_WORDS);
    Ok(())
}

struct Recovered {
    ctx: Arc<PcmContext>,
    reader: TornbitLog,
    flushed: Vec<u64>,
    tail: Vec<u64>,
}

/// Ten flushed values and twenty unflushed ones, then a crash and a restart
/// over the crash image. The reader is left at the start of the first
/// unflushed chunk.
fn crash_with_tail(crash_cdf: Vec<u32>, evict: u32) -> Result<Recovered> {
    let cfg = config(crash_cdf, evict);
    let ctx = PcmContext::new(cfg.clone(), None)?;
    let mut set = Storeset::new(&ctx);
    TornbitLog::format(&mut set, &SLOT)?;
    let mut log = reopen(&set)?;
    let flushed: Vec<u64> = (1..=10u64).collect();
    let tail: Vec<u64> = (0..20u64).map(|i| 0xF00D_0000 + i).collect();
    for &v in &flushed {
        log.write(&mut set, v)?;
    }
    log.flush(&mut set)?;
    assert_eq!(log.stats().tail, 16);
    for &v in &tail {
        log.write(&mut set, v)?;
    }
    ctx.trigger_crash(Some(&set), false)?;

    let image = ctx.crash_image().expect("crash image");
    let restarted = PcmContext::new(cfg, Some(image))?;
    let fresh = Storeset::new(&restarted);
    let mut reader = reopen(&fresh)?;
    let read = flushed
        .iter()
        .map(|_| reader.read())
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(read, flushed);
    reader.next_chunk();
    Ok(Recovered {
        ctx: restarted,
        reader,
        flushed,
        tail,
    })
}

#[test]
fn rolled_back_tail_ends_at_the_last_flush() -> Result<()> {
    let mut rec = crash_with_tail(no_partial_cdf(8), 0)?;
    assert_eq!(rec.reader.stats().stable_tail, 16);
    assert!(drain(&mut rec.reader)?.is_empty());
    Ok(())
}

#[test]
fn evicted_tail_is_recovered_as_a_prefix() -> Result<()> {
    let mut rec = crash_with_tail(no_partial_cdf(8), TOTAL_OUTCOMES)?;
    assert_eq!(rec.reader.stats().stable_tail, 32);
    let extra = drain(&mut rec.reader)?;
    assert!(!extra.is_empty());
    assert!(extra.len() < rec.tail.len());
    assert_eq!(extra[..], rec.tail[..extra.len()]);
    Ok(())
}

#[test]
fn partially_evicted_chunk_is_treated_as_torn() -> Result<()> {
    let mut rec = crash_with_tail(exact_cdf(8, 5), TOTAL_OUTCOMES)?;
    assert_eq!(rec.reader.stats().stable_tail, 16);
    assert!(drain(&mut rec.reader)?.is_empty());
    Ok(())
}

#[test]
fn writer_resumes_after_a_torn_chunk() -> Result<()> {
    let rec = crash_with_tail(exact_cdf(8, 5), TOTAL_OUTCOMES)?;
    let Recovered {
        ctx,
        mut reader,
        flushed,
        ..
    } = rec;
    let mut set = Storeset::new(&ctx);
    for v in [77u64, 78] {
        reader.write(&mut set, v)?;
    }
    reader.flush(&mut set)?;
    assert_eq!(reader.stats().stable_tail, 24);

    let mut again = reopen(&set)?;
    let replay = flushed
        .iter()
        .map(|_| again.read())
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(replay, flushed);
    again.next_chunk();
    assert_eq!([again.read()?, again.read()?], [77, 78]);
    Ok(())
}
