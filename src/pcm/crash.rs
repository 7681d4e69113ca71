#![forbid(unsafe_code)]
//! Saving old bytes before a write, retiring them on flush, and putting them
//! back when a crash is replayed.

use tracing::debug;

use super::latency::{CrashCdf, Lcg};
use super::shadow::ShadowTable;
use crate::primitives::bytes::WORD_SIZE;
use crate::primitives::region::PmemRegion;
use crate::types::{PAddr, Result};

/// Shadow table plus the generator used for crash sampling.
#[derive(Debug)]
pub struct ShadowState {
    pub(crate) table: ShadowTable,
    pub(crate) rng: Lcg,
    line_log: u32,
}

impl ShadowState {
    pub(crate) fn new(capacity: usize, line_log: u32, seed: u32) -> Self {
        Self {
            table: ShadowTable::new(capacity),
            rng: Lcg::new(seed),
            line_log,
        }
    }

    fn line_bytes(&self) -> u64 {
        1 << self.line_log
    }

    /// Records the current value of every byte of the word at `addr`
    /// selected by `mask`, unless an older value is already saved.
    pub(crate) fn save(&mut self, region: &PmemRegion, addr: PAddr, mask: u64) -> Result<()> {
        for i in 0..WORD_SIZE {
            if (mask >> (i * 8)) & 0xff == 0 {
                continue;
            }
            let byte_addr = addr.add(i);
            let block = byte_addr.align_down(self.line_log);
            let offset = byte_addr.0 - block.0;
            let shadow = self.table.add(block)?;
            if shadow.bitmask & (1 << offset) == 0 {
                shadow.bytes[offset as usize] = region.load_byte(byte_addr)?;
                shadow.bitmask |= 1 << offset;
            }
        }
        Ok(())
    }

    /// Number of lines that a word store at `addr` would add to the table.
    pub(crate) fn lines_needed(&self, addr: PAddr) -> usize {
        let first = addr.align_down(self.line_log);
        let last = addr.add(WORD_SIZE - 1).align_down(self.line_log);
        let mut needed = usize::from(self.table.get(first).is_none());
        if last != first && self.table.get(last).is_none() {
            needed += 1;
        }
        needed
    }

    /// Marks the line starting at `block` as written back.
    ///
    /// With `partial`, the crash distribution decides how many leading words
    /// made it; otherwise the whole line did. Returns true when a shadow was
    /// found.
    pub(crate) fn flush_line(&mut self, block: PAddr, partial: bool, cdf: &CrashCdf) -> bool {
        let words = (self.line_bytes() / WORD_SIZE) as usize;
        let Some(shadow) = self.table.get_mut(block) else {
            return false;
        };
        let survived = if partial {
            cdf.sample(&mut self.rng).min(words)
        } else {
            words
        };
        let durable_bytes = survived as u32 * WORD_SIZE as u32;
        let cleared = if durable_bytes >= 64 {
            u64::MAX
        } else {
            (1u64 << durable_bytes) - 1
        };
        shadow.bitmask &= !cleared;
        if shadow.bitmask == 0 {
            self.table.delete(block);
        }
        true
    }

    /// Flushes the line holding `addr` and, when the word at `addr` runs
    /// into the following line, that line too.
    pub(crate) fn flush(&mut self, addr: PAddr, partial: bool, cdf: &CrashCdf) {
        let first = addr.align_down(self.line_log);
        let last = addr.add(WORD_SIZE - 1).align_down(self.line_log);
        for block in [first, last] {
            self.flush_line(block, partial, cdf);
            if last == first {
                break;
            }
        }
    }

    /// Flushes every tracked line.
    pub(crate) fn flush_all(&mut self, partial: bool, cdf: &CrashCdf) {
        for block in self.table.blocks() {
            self.flush_line(block, partial, cdf);
        }
    }

    /// Writes back each tracked line with probability `likelihood`, honoring
    /// the partial-write distribution. Returns how many lines were picked.
    pub(crate) fn evict_random(&mut self, likelihood: u32, cdf: &CrashCdf) -> usize {
        let mut picked = 0;
        for block in self.table.blocks() {
            if self.rng.chance(likelihood) {
                self.flush_line(block, true, cdf);
                picked += 1;
            }
        }
        picked
    }

    /// Puts every still-saved byte back into `region` and empties the table.
    /// Returns how many bytes were rolled back.
    pub(crate) fn restore(&mut self, region: &PmemRegion) -> Result<usize> {
        let mut restored = 0;
        let mut pending = Vec::new();
        self.table.for_each(|block, shadow| {
            for offset in 0..self.line_bytes() {
                if shadow.bitmask & (1 << offset) != 0 {
                    pending.push((block.add(offset), shadow.bytes[offset as usize]));
                }
            }
        });
        for (addr, byte) in pending {
            region.store_byte(addr, byte)?;
            restored += 1;
        }
        debug!(lines = self.table.len(), bytes = restored, "pcm.crash.restore");
        self.table.clear();
        Ok(restored)
    }
}
