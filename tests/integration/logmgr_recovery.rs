#![allow(missing_docs)]

use std::sync::Arc;

use mnemo::config::{LogKind, PcmConfig};
use mnemo::log::{LogHandle, LogManager, ASYNC_TRUNCATION};
use mnemo::pcm::{PcmContext, Storeset};
use mnemo::primitives::bytes::mask;
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::stm::{register_log_types, TmLog, TmLogOps, TM_BASE_LOG, TM_TORNBIT_LOG};
use mnemo::{MnemoError, PAddr, Result};

const DATA: PAddr = PAddr(48 * PAGE_SIZE);

fn pool_config() -> PcmConfig {
    PcmConfig {
        region_bytes: 64 * PAGE_SIZE,
        log_pool_slots: 4,
        log_slot_words: 256,
        likelihood_evicted_cacheline: 0,
        ..PcmConfig::default()
    }
}

struct Incarnation {
    ctx: Arc<PcmContext>,
    set: Storeset,
    manager: Arc<LogManager>,
}

fn first_use() -> Result<Incarnation> {
    let ctx = PcmContext::new(pool_config(), None)?;
    let mut set = Storeset::new(&ctx);
    let manager = LogManager::init(&mut set)?;
    register_log_types(&manager, &mut set)?;
    Ok(Incarnation { ctx, set, manager })
}

/// Crashes `inc` and brings up a manager over the crash image without
/// registering any log type.
fn crash_and_restart(inc: Incarnation) -> Result<Incarnation> {
    inc.ctx.trigger_crash(Some(&inc.set), false)?;
    let image = inc.ctx.crash_image().expect("crash image");
    drop(inc);
    let ctx = PcmContext::new(pool_config(), Some(image))?;
    let mut set = Storeset::new(&ctx);
    let manager = LogManager::init(&mut set)?;
    Ok(Incarnation { ctx, set, manager })
}

fn tm_log(handle: &LogHandle) -> Arc<TmLog> {
    handle.downcast::<TmLog>().expect("transactional log")
}

/// Six commits alternating between a base and a torn-bit log. Commit `sqn`
/// writes `sqn * 10` to `DATA` and `sqn` to its own word.
fn six_commits(inc: &mut Incarnation) -> Result<()> {
    let base = inc.manager.alloc_log(&mut inc.set, TM_BASE_LOG, 0)?;
    let torn = inc.manager.alloc_log(&mut inc.set, TM_TORNBIT_LOG, 0)?;
    let logs = [tm_log(&base), tm_log(&torn)];
    for sqn in 1..=6u64 {
        let log = &logs[(sqn % 2) as usize];
        log.lock().append_commit(
            &mut inc.set,
            &[(DATA, sqn * 10, mask::FULL), (DATA.word(1 + sqn), sqn, mask::FULL)],
            sqn,
        )?;
    }
    assert_eq!(logs[1].record_counts(), (3, 0));
    Ok(())
}

#[test]
fn commits_replay_in_sequence_order_across_encodings() -> Result<()> {
    let mut inc = first_use()?;
    six_commits(&mut inc)?;
    assert_eq!(inc.set.load(DATA)?, 0, "records only, nothing installed");

    let mut inc = crash_and_restart(inc)?;
    let stats = inc.manager.stats();
    assert_eq!((stats.pending, stats.free), (2, 2));

    register_log_types(&inc.manager, &mut inc.set)?;
    assert_eq!(inc.manager.do_recovery(&mut inc.set)?, 6);
    assert_eq!(inc.set.load(DATA)?, 60);
    for sqn in 1..=6u64 {
        assert_eq!(inc.set.load(DATA.word(1 + sqn))?, sqn);
    }
    let stats = inc.manager.stats();
    assert_eq!((stats.pending, stats.free, stats.active), (0, 4, 0));
    assert_eq!(stats.recovered_units, 6);

    // replayed values were flushed and the logs emptied
    let mut inc = crash_and_restart(inc)?;
    register_log_types(&inc.manager, &mut inc.set)?;
    assert_eq!(inc.manager.do_recovery(&mut inc.set)?, 0);
    assert_eq!(inc.set.load(DATA)?, 60);
    Ok(())
}

#[test]
fn slots_stay_pending_until_their_type_is_registered() -> Result<()> {
    let mut inc = first_use()?;
    six_commits(&mut inc)?;
    let mut inc = crash_and_restart(inc)?;

    assert_eq!(inc.manager.do_recovery(&mut inc.set)?, 0);
    assert_eq!(inc.manager.stats().pending, 2);
    assert!(matches!(
        inc.manager.alloc_log(&mut inc.set, TM_BASE_LOG, 0),
        Err(MnemoError::Invalid(_))
    ));

    inc.manager.register_logtype(
        &mut inc.set,
        TM_TORNBIT_LOG,
        Arc::new(TmLogOps::new(LogKind::Tornbit)),
    )?;
    // odd sequence numbers went to the torn-bit log
    assert_eq!(inc.manager.do_recovery(&mut inc.set)?, 3);
    assert_eq!(inc.set.load(DATA)?, 50);
    assert_eq!(inc.set.load(DATA.word(2))?, 1);
    assert_eq!(inc.set.load(DATA.word(3))?, 0);
    assert_eq!(inc.manager.stats().pending, 1);
    Ok(())
}

#[test]
fn freeing_twice_is_rejected() -> Result<()> {
    let mut inc = first_use()?;
    let handle = inc.manager.alloc_log(&mut inc.set, TM_BASE_LOG, 0)?;
    inc.manager.free_log(&mut inc.set, &handle)?;
    assert!(matches!(
        inc.manager.free_log(&mut inc.set, &handle),
        Err(MnemoError::Invalid(_))
    ));
    assert_eq!(inc.manager.stats().free, 4);
    Ok(())
}

#[test]
fn freed_slot_is_reused_for_the_same_type() -> Result<()> {
    let mut inc = first_use()?;
    let first = inc.manager.alloc_log(&mut inc.set, TM_TORNBIT_LOG, 0)?;
    let index = first.index();
    inc.manager.free_log(&mut inc.set, &first)?;
    let _other = inc.manager.alloc_log(&mut inc.set, TM_BASE_LOG, 0)?;
    let again = inc.manager.alloc_log(&mut inc.set, TM_TORNBIT_LOG, 0)?;
    assert_eq!(again.index(), index);
    Ok(())
}

#[test]
fn truncation_writes_back_before_dropping_records() -> Result<()> {
    let mut inc = first_use()?;
    let handle = inc
        .manager
        .alloc_log(&mut inc.set, TM_BASE_LOG, ASYNC_TRUNCATION)?;
    assert!(handle.is_async());
    let log = tm_log(&handle);

    inc.set.wb_store(DATA, 99)?;
    log.lock()
        .append_commit(&mut inc.set, &[(DATA, 99, mask::FULL)], 1)?;
    assert_eq!(inc.manager.truncate_now(&mut inc.set)?, 1);
    let stats = log.lock().stats();
    assert_eq!(stats.head, stats.tail);
    assert_eq!(inc.manager.stats().truncated_units, 1);

    let mut inc = crash_and_restart(inc)?;
    assert_eq!(inc.set.load(DATA)?, 99);
    register_log_types(&inc.manager, &mut inc.set)?;
    assert_eq!(inc.manager.do_recovery(&mut inc.set)?, 0);
    Ok(())
}

#[test]
fn synchronous_logs_are_skipped_by_truncation() -> Result<()> {
    let mut inc = first_use()?;
    let handle = inc.manager.alloc_log(&mut inc.set, TM_BASE_LOG, 0)?;
    let log = tm_log(&handle);
    log.lock()
        .append_commit(&mut inc.set, &[(DATA, 5, mask::FULL)], 1)?;
    assert_eq!(inc.manager.truncate_now(&mut inc.set)?, 0);
    let stats = log.lock().stats();
    assert_eq!(stats.head, 0);
    assert_eq!(stats.tail, 8);
    Ok(())
}
