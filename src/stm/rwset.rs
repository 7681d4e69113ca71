#![forbid(unsafe_code)]
//! Read and write sets.
//!
//! Both sets have a soft capacity. Outgrowing it doubles the capacity and
//! restarts the transaction with [`RestartReason::Reallocate`], since lock
//! words hold write-set indices that must stay valid for the whole attempt.

use crate::primitives::bytes::mask;
use crate::types::{MnemoError, PAddr, RestartReason, Result};

/// Lock observed by a read, with the version seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadEntry {
    /// Lock index.
    pub lock: usize,
    /// Version the lock had when the value was read.
    pub version: u64,
}

/// Buffered write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteEntry {
    /// Target word.
    pub addr: PAddr,
    /// Pending value; only bits under `mask` are meaningful.
    pub value: u64,
    /// Bits to install.
    pub mask: u64,
    /// Lock index covering `addr`.
    pub lock: usize,
    /// Version of the lock before it was acquired.
    pub version: u64,
    /// Next entry under the same lock.
    pub next: Option<usize>,
    /// True for the first entry under a lock, the one the lock word names.
    pub head: bool,
}

impl WriteEntry {
    /// Value a reader of `addr` sees, given the word currently in memory.
    pub fn visible(&self, memory: u64) -> u64 {
        if self.mask == mask::FULL {
            self.value
        } else {
            mask::apply(memory, self.value, self.mask)
        }
    }
}

/// Locks read by the running attempt.
#[derive(Debug)]
pub struct ReadSet {
    entries: Vec<ReadEntry>,
    capacity: usize,
}

impl ReadSet {
    /// Empty set with a soft capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a read.
    pub fn push(&mut self, entry: ReadEntry) -> Result<()> {
        if self.entries.len() == self.capacity {
            self.capacity *= 2;
            return Err(MnemoError::Restart(RestartReason::Reallocate));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Recorded reads.
    pub fn iter(&self) -> impl Iterator<Item = &ReadEntry> {
        self.entries.iter()
    }

    /// Number of reads.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was read.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current soft capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forgets every read.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Writes buffered by the running attempt, chained per lock.
#[derive(Debug)]
pub struct WriteSet {
    entries: Vec<WriteEntry>,
    capacity: usize,
}

impl WriteSet {
    /// Empty set with a soft capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn reserve(&mut self) -> Result<usize> {
        if self.entries.len() == self.capacity {
            self.capacity *= 2;
            return Err(MnemoError::Restart(RestartReason::Reallocate));
        }
        Ok(self.entries.len())
    }

    /// Adds the first entry under a lock about to be acquired; returns its
    /// index for the lock word.
    pub fn push_head(
        &mut self,
        addr: PAddr,
        value: u64,
        bits: u64,
        lock: usize,
        version: u64,
    ) -> Result<usize> {
        let index = self.reserve()?;
        self.entries.push(WriteEntry {
            addr,
            value,
            mask: bits,
            lock,
            version,
            next: None,
            head: true,
        });
        Ok(index)
    }

    /// Undoes [`WriteSet::push_head`] after a lost acquisition race.
    pub fn pop_head(&mut self) {
        self.entries.pop();
    }

    /// Entry for `addr` in the chain starting at `head`.
    pub fn find(&self, head: usize, addr: PAddr) -> Option<usize> {
        let mut cursor = Some(head);
        while let Some(i) = cursor {
            let entry = self.entries.get(i)?;
            if entry.addr == addr {
                return Some(i);
            }
            cursor = entry.next;
        }
        None
    }

    /// Merges a write into the chain starting at `head`, appending an entry
    /// when `addr` has none yet.
    pub fn merge(&mut self, head: usize, addr: PAddr, value: u64, bits: u64) -> Result<()> {
        if let Some(i) = self.find(head, addr) {
            let entry = &mut self.entries[i];
            entry.value = mask::apply(entry.value, value, bits);
            entry.mask |= bits;
            return Ok(());
        }
        let index = self.reserve()?;
        let mut last = head;
        while let Some(next) = self.entries[last].next {
            last = next;
        }
        let (lock, version) = (self.entries[head].lock, self.entries[head].version);
        self.entries.push(WriteEntry {
            addr,
            value,
            mask: bits,
            lock,
            version,
            next: None,
            head: false,
        });
        self.entries[last].next = Some(index);
        Ok(())
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&WriteEntry> {
        self.entries.get(index)
    }

    /// Buffered writes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &WriteEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current soft capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forgets every write.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
