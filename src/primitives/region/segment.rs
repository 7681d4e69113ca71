#![forbid(unsafe_code)]
//! Durable segment directory kept in the first page of a region.
//!
//! Layout: `[magic, count, (start, len, flags) * count]`, one word each.

use tracing::debug;

use super::{PmemRegion, PAGE_SIZE};
use crate::types::{MnemoError, PAddr, Result};

const DIR_MAGIC: u64 = 0x4d4e_454d_4f53_4547;
const DIR_HEADER_WORDS: u64 = 2;
const ENTRY_WORDS: u64 = 3;

/// Number of segments the directory page can describe.
pub const SEGMENT_DIR_CAPACITY: u64 = (PAGE_SIZE / 8 - DIR_HEADER_WORDS) / ENTRY_WORDS;

/// A byte range handed out by [`PmemRegion::alloc_region`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// First byte of the segment.
    pub start: PAddr,
    /// Length in bytes, a multiple of the page size.
    pub len: u64,
    /// Caller-defined flags, persisted alongside the range.
    pub flags: u64,
}

impl Segment {
    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.start.0 + self.len
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        start < self.end() && self.start.0 < start + len
    }
}

impl PmemRegion {
    fn dir_word(&self, index: u64) -> Result<u64> {
        self.load(PAddr(index * 8))
    }

    fn set_dir_word(&self, index: u64, value: u64) -> Result<()> {
        self.store(PAddr(index * 8), value)
    }

    fn segments(&self) -> Result<Vec<Segment>> {
        if self.dir_word(0)? != DIR_MAGIC {
            return Ok(Vec::new());
        }
        let count = self.dir_word(1)?;
        if count > SEGMENT_DIR_CAPACITY {
            return Err(MnemoError::Corruption("segment directory count out of range"));
        }
        (0..count)
            .map(|i| {
                let base = DIR_HEADER_WORDS + i * ENTRY_WORDS;
                Ok(Segment {
                    start: PAddr(self.dir_word(base)?),
                    len: self.dir_word(base + 1)?,
                    flags: self.dir_word(base + 2)?,
                })
            })
            .collect()
    }

    /// Reserves `len` bytes (rounded up to a page) that can be found again
    /// after a restart. `hint` is honored when it is page aligned and free.
    pub fn alloc_region(&self, hint: Option<PAddr>, len: u64, flags: u64) -> Result<Segment> {
        if len == 0 {
            return Err(MnemoError::Invalid("segment length must be non-zero"));
        }
        let len = len
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(MnemoError::Invalid("segment length overflow"))?;
        let _guard = self.dir_lock.lock();
        let existing = self.segments()?;
        if existing.len() as u64 >= SEGMENT_DIR_CAPACITY {
            return Err(MnemoError::Invalid("segment directory full"));
        }
        let fits = |start: u64| {
            start >= PAGE_SIZE
                && start % PAGE_SIZE == 0
                && start
                    .checked_add(len)
                    .map(|end| end <= self.len())
                    .unwrap_or(false)
                && !existing.iter().any(|s| s.overlaps(start, len))
        };
        let start = match hint {
            Some(h) if fits(h.0) => h.0,
            _ => {
                let next = existing
                    .iter()
                    .map(Segment::end)
                    .max()
                    .unwrap_or(PAGE_SIZE);
                if !fits(next) {
                    return Err(MnemoError::InvalidOwned(format!(
                        "persistent region exhausted: {len} bytes requested"
                    )));
                }
                next
            }
        };
        let count = existing.len() as u64;
        let base = DIR_HEADER_WORDS + count * ENTRY_WORDS;
        self.set_dir_word(base, start)?;
        self.set_dir_word(base + 1, len)?;
        self.set_dir_word(base + 2, flags)?;
        self.set_dir_word(1, count + 1)?;
        self.set_dir_word(0, DIR_MAGIC)?;
        debug!(start, len, flags, "region.alloc_region");
        Ok(Segment {
            start: PAddr(start),
            len,
            flags,
        })
    }

    /// Returns the segment containing `addr`, if any.
    pub fn find_region(&self, addr: PAddr) -> Result<Option<Segment>> {
        let _guard = self.dir_lock.lock();
        Ok(self
            .segments()?
            .into_iter()
            .find(|s| addr.0 >= s.start.0 && addr.0 < s.end()))
    }
}
