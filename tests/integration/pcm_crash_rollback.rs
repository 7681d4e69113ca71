#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mnemo::config::PcmConfig;
use mnemo::pcm::{Mode, PcmContext, Storeset};
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::{PAddr, Result};

const A: PAddr = PAddr(8 * PAGE_SIZE);
const B: PAddr = PAddr(8 * PAGE_SIZE + 256);

fn quiet_config() -> PcmConfig {
    PcmConfig {
        region_bytes: 32 * PAGE_SIZE,
        likelihood_evicted_cacheline: 0,
        ..PcmConfig::default()
    }
}

#[test]
fn unflushed_stores_roll_back_and_flushed_ones_survive() -> Result<()> {
    let ctx = PcmContext::new(quiet_config(), None)?;
    let mut set = Storeset::new(&ctx);
    set.wb_store(A, 0x1111)?;
    set.wb_store(B, 0x2222)?;
    set.wb_flush(A)?;
    set.wb_store_masked(A.add(8), 0xAB00, 0xFF00)?;

    let report = ctx.trigger_crash(Some(&set), false)?.expect("first crash");
    assert_eq!(report.storesets, 1);
    assert_eq!(report.evicted_lines, 0);
    // B's whole word plus the single byte of the masked store.
    assert_eq!(report.restored_bytes, 9);
    assert_eq!(set.load(A)?, 0x1111);
    assert_eq!(set.load(B)?, 0);
    assert_eq!(set.load(A.add(8))?, 0);
    assert_eq!(set.pending_lines(), 0);
    Ok(())
}

#[test]
fn fresh_word_reverts_unless_flushed() -> Result<()> {
    for flush in [false, true] {
        let ctx = PcmContext::new(quiet_config(), None)?;
        let mut set = Storeset::new(&ctx);
        set.wb_store(A, 0xAB)?;
        if flush {
            set.wb_flush(A)?;
        }
        ctx.trigger_crash(Some(&set), false)?;
        let expected = if flush { 0xAB } else { 0 };
        assert_eq!(set.load(A)?, expected);
    }
    Ok(())
}

#[test]
fn non_temporal_stores_are_durable_only_after_nt_flush() -> Result<()> {
    let ctx = PcmContext::new(quiet_config(), None)?;
    let mut set = Storeset::new(&ctx);
    set.nt_store(A, 7)?;
    set.nt_flush()?;
    set.nt_store(B, 9)?;
    ctx.trigger_crash(Some(&set), false)?;
    assert_eq!(set.load(A)?, 7);
    assert_eq!(set.load(B)?, 0);
    Ok(())
}

#[test]
fn crash_image_ignores_writes_made_after_the_crash() -> Result<()> {
    let ctx = PcmContext::new(quiet_config(), None)?;
    let mut set = Storeset::new(&ctx);
    set.wb_store(A, 1)?;
    set.wb_flush(A)?;
    ctx.trigger_crash(Some(&set), false)?;
    assert_eq!(ctx.mode(), Mode::PostCrash);

    set.wb_store(B, 5)?;
    set.wb_flush(B)?;
    let image = ctx.crash_image().expect("image captured");
    let restarted = PcmContext::new(quiet_config(), Some(image))?;
    let fresh = Storeset::new(&restarted);
    assert_eq!(fresh.load(A)?, 1);
    assert_eq!(fresh.load(B)?, 0);
    Ok(())
}

#[test]
fn another_crash_needs_a_reset() -> Result<()> {
    let ctx = PcmContext::new(quiet_config(), None)?;
    let mut set = Storeset::new(&ctx);
    set.wb_store(A, 3)?;
    assert!(ctx.trigger_crash(Some(&set), false)?.is_some());
    set.wb_store(A, 4)?;
    assert!(ctx.trigger_crash(Some(&set), false)?.is_none());
    assert_eq!(set.load(A)?, 4);

    ctx.trigger_crash_reset();
    assert_eq!(ctx.mode(), Mode::Normal);
    let report = ctx.trigger_crash(Some(&set), false)?.expect("crash after reset");
    assert_eq!(report.restored_bytes, 8);
    assert_eq!(set.load(A)?, 0);
    Ok(())
}

#[test]
fn wait_halt_parks_other_writers_before_rolling_back() -> Result<()> {
    let ctx = PcmContext::new(quiet_config(), None)?;
    let stop = Arc::new(AtomicBool::new(false));
    let written = Arc::new(AtomicU64::new(0));

    let worker = {
        let (ctx, stop, written) = (Arc::clone(&ctx), Arc::clone(&stop), Arc::clone(&written));
        thread::spawn(move || -> Result<()> {
            let mut set = Storeset::new(&ctx);
            let mut i = 1u64;
            while !stop.load(Ordering::Acquire) {
                set.wb_store(B, i)?;
                written.fetch_add(1, Ordering::AcqRel);
                i += 1;
            }
            Ok(())
        })
    };
    while written.load(Ordering::Acquire) < 100 {
        thread::sleep(Duration::from_millis(1));
    }

    let report = ctx.trigger_crash(None, true)?.expect("crash ran");
    assert_eq!(report.storesets, 1);
    let image = ctx.crash_image().expect("image captured");
    stop.store(true, Ordering::Release);
    worker.join().expect("worker thread")?;

    let restarted = PcmContext::new(quiet_config(), Some(image))?;
    let fresh = Storeset::new(&restarted);
    assert_eq!(fresh.load(B)?, 0, "no store of the parked writer was flushed");
    Ok(())
}
