#![allow(missing_docs)]

use mnemo::config::{exact_cdf, no_partial_cdf, PcmConfig, TOTAL_OUTCOMES};
use mnemo::pcm::{PcmContext, Storeset};
use mnemo::primitives::region::PAGE_SIZE;
use mnemo::{PAddr, Result};

const LINE: PAddr = PAddr(4 * PAGE_SIZE);
const WORDS: u64 = 8;

fn config(crash_cdf: Vec<u32>, likelihood_evicted_cacheline: u32) -> PcmConfig {
    PcmConfig {
        region_bytes: 16 * PAGE_SIZE,
        crash_cdf,
        likelihood_evicted_cacheline,
        ..PcmConfig::default()
    }
}

/// Dirties the whole line with `value`, crashes and returns how many words
/// kept it.
fn crash_line(ctx: &std::sync::Arc<PcmContext>, set: &mut Storeset, value: u64) -> Result<usize> {
    for w in 0..WORDS {
        set.wb_store(LINE.word(w), value)?;
    }
    ctx.trigger_crash(Some(set), false)?;
    let mut survived = 0;
    for w in 0..WORDS {
        if set.load(LINE.word(w))? == value {
            survived += 1;
        }
    }
    ctx.trigger_crash_reset();
    Ok(survived)
}

#[test]
fn exact_distribution_keeps_the_leading_words() -> Result<()> {
    let ctx = PcmContext::new(config(exact_cdf(8, 3), TOTAL_OUTCOMES), None)?;
    let mut set = Storeset::new(&ctx);
    for round in 1..=5u64 {
        assert_eq!(crash_line(&ctx, &mut set, round)?, 3);
        assert_eq!(set.load(LINE.word(2))?, round);
        assert_ne!(set.load(LINE.word(3))?, round);
    }
    Ok(())
}

#[test]
fn evicted_lines_survive_whole_without_partial_mass() -> Result<()> {
    let ctx = PcmContext::new(config(no_partial_cdf(8), TOTAL_OUTCOMES), None)?;
    let mut set = Storeset::new(&ctx);
    assert_eq!(crash_line(&ctx, &mut set, 77)?, 8);
    Ok(())
}

#[test]
fn lines_that_are_never_evicted_roll_back_entirely() -> Result<()> {
    let ctx = PcmContext::new(config(no_partial_cdf(8), 0), None)?;
    let mut set = Storeset::new(&ctx);
    for round in 1..=5u64 {
        assert_eq!(crash_line(&ctx, &mut set, round)?, 0);
    }
    Ok(())
}

#[test]
fn observed_frequencies_follow_the_weights() -> Result<()> {
    let mut weights = vec![0; 9];
    weights[0] = TOTAL_OUTCOMES / 4;
    weights[8] = TOTAL_OUTCOMES - weights[0];
    let ctx = PcmContext::new(config(weights, TOTAL_OUTCOMES), None)?;
    let mut set = Storeset::new(&ctx);

    let rounds = 800u64;
    let mut histogram = [0u64; 9];
    for round in 1..=rounds {
        histogram[crash_line(&ctx, &mut set, round)?] += 1;
    }
    assert_eq!(histogram[1..8].iter().sum::<u64>(), 0);
    let empty = histogram[0] as f64 / rounds as f64;
    assert!((0.15..0.35).contains(&empty), "observed {empty}");
    Ok(())
}

#[test]
fn mismatched_distribution_is_rejected() {
    let mut weights = no_partial_cdf(8);
    weights.push(0);
    assert!(PcmContext::new(config(weights, 0), None).is_err());

    let mut short = no_partial_cdf(8);
    short[8] -= 1;
    assert!(PcmContext::new(config(short, 0), None).is_err());
}
