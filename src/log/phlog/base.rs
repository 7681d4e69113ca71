#![forbid(unsafe_code)]
//! Log encoding with explicit `head` and `tail` metadata words.
//!
//! Metadata: `[generic_flags, head, tail, reserved]`.

use std::sync::Arc;

use tracing::debug;

use super::{
    chunk_overflows, free_words, region_of, ChunkBuffer, LogSlot, PhlogStats, PhysicalLog,
    CHUNK_WORDS,
};
use crate::pcm::Storeset;
use crate::primitives::region::PmemRegion;
use crate::types::{MnemoError, Result};

const NVMD_HEAD: u64 = 1;
const NVMD_TAIL: u64 = 2;

/// Log whose durable extent is published through the `tail` word.
pub struct BaseLog {
    slot: LogSlot,
    region: Arc<PmemRegion>,
    buffer: ChunkBuffer,
    head: u64,
    tail: u64,
    read_index: u64,
    chunk_writes: u64,
}

impl std::fmt::Debug for BaseLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseLog")
            .field("slot", &self.slot.index)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("read_index", &self.read_index)
            .finish()
    }
}

impl BaseLog {
    /// Resets the persistent cursors of `slot` to an empty log.
    pub fn format(set: &mut Storeset, slot: &LogSlot) -> Result<()> {
        slot.validate()?;
        set.nt_store(slot.nvmd_word(NVMD_HEAD), 0)?;
        set.nt_store(slot.nvmd_word(NVMD_TAIL), 0)?;
        set.nt_flush()?;
        debug!(slot = slot.index, "phlog.base.format");
        Ok(())
    }

    /// Opens `slot` from its persisted cursors.
    pub fn open(set: &Storeset, slot: LogSlot) -> Result<Self> {
        slot.validate()?;
        let region = region_of(set);
        let mask = slot.words - 1;
        let head = region.load(slot.nvmd_word(NVMD_HEAD))? & mask;
        let tail = region.load(slot.nvmd_word(NVMD_TAIL))? & mask;
        Ok(Self {
            slot,
            region,
            buffer: ChunkBuffer::default(),
            head,
            tail,
            read_index: head,
            chunk_writes: 0,
        })
    }

    fn mask(&self) -> u64 {
        self.slot.words - 1
    }

    fn published_tail(&self) -> u64 {
        self.region
            .load(self.slot.nvmd_word(NVMD_TAIL))
            .map(|t| t & self.mask())
            .unwrap_or(self.read_index)
    }

    fn emit_chunk(&mut self, set: &mut Storeset) -> Result<()> {
        self.buffer.emit(set, &self.slot, self.tail, 0)?;
        self.tail = (self.tail + CHUNK_WORDS) & self.mask();
        self.chunk_writes += 1;
        Ok(())
    }
}

impl PhysicalLog for BaseLog {
    fn write(&mut self, set: &mut Storeset, value: u64) -> Result<()> {
        if self.buffer.len() + 1 == CHUNK_WORDS as usize
            && chunk_overflows(self.head, self.tail, self.slot.words)
        {
            return Err(MnemoError::LogFull);
        }
        self.buffer.push(value);
        if self.buffer.is_full() {
            self.emit_chunk(set)?;
        }
        Ok(())
    }

    fn flush(&mut self, set: &mut Storeset) -> Result<()> {
        if self.buffer.len() > 0 {
            if chunk_overflows(self.head, self.tail, self.slot.words) {
                return Err(MnemoError::LogFull);
            }
            self.emit_chunk(set)?;
        }
        set.seq_flush()?;
        set.nt_store(self.slot.nvmd_word(NVMD_TAIL), self.tail)?;
        set.nt_flush()
    }

    fn read(&mut self) -> Result<u64> {
        if self.read_index == self.published_tail() {
            return Err(MnemoError::NoData);
        }
        let value = self.region.load(self.slot.data_word(self.read_index))?;
        self.read_index = (self.read_index + 1) & self.mask();
        Ok(value)
    }

    fn stable_exists(&self) -> bool {
        self.read_index != self.published_tail()
    }

    fn next_chunk(&mut self) {
        let start = self.read_index & !(CHUNK_WORDS - 1);
        if start != self.read_index {
            self.read_index = (start + CHUNK_WORDS) & self.mask();
        }
    }

    fn checkpoint(&self) -> Result<u64> {
        Ok(self.read_index)
    }

    fn restore(&mut self, mark: u64) {
        self.read_index = mark & self.mask();
    }

    fn truncate_sync(&mut self, set: &mut Storeset) -> Result<()> {
        self.head = self.tail;
        self.read_index = self.head;
        set.nt_store(self.slot.nvmd_word(NVMD_HEAD), self.head)?;
        set.nt_flush()
    }

    fn truncate_async(&mut self, set: &mut Storeset) -> Result<()> {
        if self.read_index % CHUNK_WORDS != 0 {
            return Err(MnemoError::Invalid("truncation point must start a chunk"));
        }
        self.head = self.read_index;
        set.nt_flush()?;
        set.nt_store(self.slot.nvmd_word(NVMD_HEAD), self.head)?;
        set.nt_flush()
    }

    fn rewind_writer(&mut self) {
        self.tail = self.published_tail();
        self.buffer = ChunkBuffer::default();
    }

    fn check_consistency(&mut self) -> Result<u64> {
        let stable = self.published_tail();
        self.tail = stable;
        self.buffer = ChunkBuffer::default();
        Ok(stable)
    }

    fn stats(&self) -> PhlogStats {
        PhlogStats {
            head: self.head,
            tail: self.tail,
            stable_tail: self.published_tail(),
            read_index: self.read_index,
            capacity: self.slot.words,
            free_words: free_words(self.head, self.tail, self.slot.words),
            chunk_writes: self.chunk_writes,
        }
    }
}
