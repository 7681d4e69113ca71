#![forbid(unsafe_code)]
//! Per-storeset table of cachelines holding not-yet-durable bytes.

use rustc_hash::FxHashMap;

use crate::types::{MnemoError, PAddr, Result};

/// Largest supported cacheline; one bitmask bit per byte.
pub const MAX_CACHELINE: usize = 64;

/// Pre-write bytes of one cacheline.
///
/// Bit `i` of `bitmask` is set while `bytes[i]` holds the value byte `i` had
/// before it was last written and that write has not been flushed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachelineShadow {
    /// Bytes whose saved value is still needed.
    pub bitmask: u64,
    /// Saved originals.
    pub bytes: [u8; MAX_CACHELINE],
}

impl Default for CachelineShadow {
    fn default() -> Self {
        Self {
            bitmask: 0,
            bytes: [0; MAX_CACHELINE],
        }
    }
}

/// Map from cacheline start address to its shadow.
#[derive(Debug)]
pub struct ShadowTable {
    entries: FxHashMap<u64, CachelineShadow>,
    capacity: usize,
}

impl ShadowTable {
    /// Creates an empty table that holds at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            capacity,
        }
    }

    /// Shadow of the line starting at `block`.
    pub fn get(&self, block: PAddr) -> Option<&CachelineShadow> {
        self.entries.get(&block.0)
    }

    /// Mutable shadow of the line starting at `block`.
    pub fn get_mut(&mut self, block: PAddr) -> Option<&mut CachelineShadow> {
        self.entries.get_mut(&block.0)
    }

    /// Returns the existing shadow or inserts a clean one.
    ///
    /// Fails with [`MnemoError::ShadowExhausted`] when a new line would exceed
    /// the capacity.
    pub fn add(&mut self, block: PAddr) -> Result<&mut CachelineShadow> {
        let len = self.entries.len();
        match self.entries.entry(block.0) {
            std::collections::hash_map::Entry::Occupied(slot) => Ok(slot.into_mut()),
            std::collections::hash_map::Entry::Vacant(slot) => {
                if len >= self.capacity {
                    return Err(MnemoError::ShadowExhausted);
                }
                Ok(slot.insert(CachelineShadow::default()))
            }
        }
    }

    /// Drops the shadow of `block`, if any.
    pub fn delete(&mut self, block: PAddr) {
        self.entries.remove(&block.0);
    }

    /// Start addresses of every tracked line.
    pub fn blocks(&self) -> Vec<PAddr> {
        self.entries.keys().map(|&b| PAddr(b)).collect()
    }

    /// Visits every live entry.
    pub fn for_each(&self, mut f: impl FnMut(PAddr, &CachelineShadow)) {
        for (&block, shadow) in &self.entries {
            f(PAddr(block), shadow);
        }
    }

    /// Number of tracked lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
