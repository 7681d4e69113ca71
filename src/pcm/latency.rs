#![forbid(unsafe_code)]
//! Sampling and busy-wait latency injection.

use std::time::{Duration, Instant};

use crate::config::{PcmConfig, TOTAL_OUTCOMES};
use crate::types::{MnemoError, Result};

/// Reentrant linear congruential generator, one per storeset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lcg {
    seed: u32,
}

impl Lcg {
    /// Seeds the generator.
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    /// Next raw value.
    pub fn next_u32(&mut self) -> u32 {
        self.seed = self.seed.wrapping_mul(196_314_165).wrapping_add(907_633_515);
        self.seed
    }

    /// Uniform outcome in `[0, TOTAL_OUTCOMES)`.
    pub fn draw(&mut self) -> u32 {
        self.next_u32() % TOTAL_OUTCOMES
    }

    /// True with probability `likelihood / TOTAL_OUTCOMES`.
    pub fn chance(&mut self, likelihood: u32) -> bool {
        self.draw() < likelihood
    }
}

/// Distribution of how many words of a dirty cacheline survive a crash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashCdf {
    cumulative: Vec<u32>,
}

impl CrashCdf {
    /// Builds the running sums of `weights`, which must add up to
    /// [`TOTAL_OUTCOMES`].
    pub fn from_weights(weights: &[u32]) -> Result<Self> {
        if weights.len() < 2 {
            return Err(MnemoError::Invalid("crash cdf needs at least two buckets"));
        }
        let mut running = 0u64;
        let cumulative = weights
            .iter()
            .map(|&w| {
                running += w as u64;
                running.min(u32::MAX as u64) as u32
            })
            .collect();
        if running != TOTAL_OUTCOMES as u64 {
            return Err(MnemoError::Invalid("crash cdf weights must sum to 1000000"));
        }
        Ok(Self { cumulative })
    }

    /// Words per cacheline this distribution describes.
    pub fn words(&self) -> usize {
        self.cumulative.len() - 1
    }

    /// Maps a draw in `[0, TOTAL_OUTCOMES)` to a bucket.
    ///
    /// The draw is shifted to `1..=TOTAL_OUTCOMES` and the first bucket whose
    /// running sum reaches it wins, so a zero-weight bucket is never chosen.
    pub fn bucket(&self, draw: u32) -> usize {
        let target = draw % TOTAL_OUTCOMES + 1;
        self.cumulative
            .iter()
            .position(|&sum| sum >= target)
            .unwrap_or(self.words())
    }

    /// Samples a bucket with `rng`.
    pub fn sample(&self, rng: &mut Lcg) -> usize {
        self.bucket(rng.draw())
    }
}

/// Emulated write latency.
#[derive(Clone, Debug)]
pub struct LatencyModel {
    enabled: bool,
    write: Duration,
    store_blockwaits: u32,
    stream_period_mask: u64,
}

impl LatencyModel {
    /// Derives the model from configuration.
    pub fn new(config: &PcmConfig) -> Self {
        let cycles = config.write_latency_ns * config.cpu_freq_mhz / 1000;
        let write = Duration::from_nanos(cycles * 1000 / config.cpu_freq_mhz.max(1));
        let period = config.memory_banking_factor as u64 * config.words_per_line() as u64;
        Self {
            enabled: config.latency_enabled,
            write,
            store_blockwaits: config.likelihood_store_blockwaits,
            stream_period_mask: period.saturating_sub(1),
        }
    }

    /// Whether any spinning happens at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Latency of one write reaching the medium.
    pub fn write_latency(&self) -> Duration {
        self.write
    }

    /// Chance, out of [`TOTAL_OUTCOMES`], that a write-back store stalls.
    pub fn store_blockwaits(&self) -> u32 {
        self.store_blockwaits
    }

    /// Mask applied to the sequential-stream counter.
    pub fn stream_period_mask(&self) -> u64 {
        self.stream_period_mask
    }

    /// Busy-waits `writes` write latencies.
    pub fn spin(&self, writes: u64) {
        if !self.enabled || writes == 0 {
            return;
        }
        spin_for(self.write.saturating_mul(writes.min(u32::MAX as u64) as u32));
    }
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}
