#![forbid(unsafe_code)]
//! Circular word logs living in emulated persistent memory.
//!
//! Writers collect words in a one-cacheline software buffer and emit whole
//! chunks with sequential-stream stores, so `head` and `tail` only ever move
//! by [`CHUNK_WORDS`]. Two encodings share the [`PhysicalLog`] contract:
//! [`BaseLog`] publishes its tail in metadata behind a fence, while
//! [`TornbitLog`] tags every slot with a wrap parity bit and needs no tail.

use std::sync::Arc;

use crate::pcm::Storeset;
use crate::primitives::region::PmemRegion;
use crate::types::{MnemoError, PAddr, Result};

mod base;
mod tornbit;

pub use base::BaseLog;
pub use tornbit::TornbitLog;

/// Words emitted per durable chunk: one 64-byte cacheline.
pub const CHUNK_WORDS: u64 = 8;

/// Byte size of a slot's metadata block.
pub const NVMD_BYTES: u64 = 32;

/// Word offset of the generic flags shared by every encoding.
pub const NVMD_GENERIC_FLAGS: u64 = 0;

/// Where one physical log lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogSlot {
    /// Pool index.
    pub index: usize,
    /// Metadata block.
    pub nvmd: PAddr,
    /// First word of the circular buffer.
    pub data: PAddr,
    /// Capacity in words; a power of two and a multiple of [`CHUNK_WORDS`].
    pub words: u64,
}

impl LogSlot {
    /// Address of metadata word `index`.
    pub fn nvmd_word(&self, index: u64) -> PAddr {
        self.nvmd.word(index)
    }

    /// Address of ring slot `index`.
    pub fn data_word(&self, index: u64) -> PAddr {
        self.data.word(index & (self.words - 1))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.words.is_power_of_two() || self.words < 2 * CHUNK_WORDS {
            return Err(MnemoError::Invalid(
                "log capacity must be a power of two of at least two chunks",
            ));
        }
        Ok(())
    }
}

/// Snapshot of a log's cursors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhlogStats {
    /// Oldest live slot.
    pub head: u64,
    /// Next slot the writer fills.
    pub tail: u64,
    /// Last slot known durable.
    pub stable_tail: u64,
    /// Reader cursor.
    pub read_index: u64,
    /// Ring capacity in words.
    pub capacity: u64,
    /// Words that can still be written before the log is full.
    pub free_words: u64,
    /// Chunks emitted since the log was opened.
    pub chunk_writes: u64,
}

/// Contract shared by the log encodings.
pub trait PhysicalLog: Send {
    /// Appends one word; emits a chunk when the buffer fills.
    ///
    /// Fails with [`MnemoError::LogFull`] when the chunk would run into
    /// `head`; the log is unchanged in that case.
    fn write(&mut self, set: &mut Storeset, value: u64) -> Result<()>;

    /// Pads and emits any buffered words and makes everything written so far
    /// durable.
    fn flush(&mut self, set: &mut Storeset) -> Result<()>;

    /// Next durable word, or [`MnemoError::NoData`].
    fn read(&mut self) -> Result<u64>;

    /// True when [`PhysicalLog::read`] may return more data.
    fn stable_exists(&self) -> bool;

    /// Moves the reader to the start of the next chunk, skipping padding.
    fn next_chunk(&mut self);

    /// Remembers the reader position. Fails in the middle of a packed value.
    fn checkpoint(&self) -> Result<u64>;

    /// Rewinds the reader to a checkpoint.
    fn restore(&mut self, mark: u64);

    /// Drops everything written so far and publishes the new head.
    fn truncate_sync(&mut self, set: &mut Storeset) -> Result<()>;

    /// Drops everything before the reader and publishes the new head.
    fn truncate_async(&mut self, set: &mut Storeset) -> Result<()>;

    /// Drops buffered and unflushed words, moving the writer back to the
    /// last durable position.
    fn rewind_writer(&mut self);

    /// Rebuilds the durable extent from persistent state after a restart and
    /// positions the writer after it. Returns the stable tail.
    fn check_consistency(&mut self) -> Result<u64>;

    /// Cursor snapshot.
    fn stats(&self) -> PhlogStats;
}

/// Software buffer shared by both encodings.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChunkBuffer {
    words: [u64; CHUNK_WORDS as usize],
    count: usize,
}

impl ChunkBuffer {
    pub(crate) fn push(&mut self, word: u64) {
        self.words[self.count] = word;
        self.count += 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_full(&self) -> bool {
        self.count == CHUNK_WORDS as usize
    }

    /// Writes the buffer (zero padded) at `tail` with `tag` or'ed into every
    /// slot, then empties it.
    pub(crate) fn emit(
        &mut self,
        set: &mut Storeset,
        slot: &LogSlot,
        tail: u64,
        tag: u64,
    ) -> Result<()> {
        for (k, word) in self.words.iter().enumerate() {
            set.seq_store(slot.data_word(tail + k as u64), tag | *word)?;
        }
        *self = ChunkBuffer::default();
        Ok(())
    }
}

/// Free words between `tail` and `head`, keeping one chunk as a gap.
pub(crate) fn free_words(head: u64, tail: u64, capacity: u64) -> u64 {
    head.wrapping_sub(tail).wrapping_sub(CHUNK_WORDS) & (capacity - 1)
}

/// True when emitting one more chunk at `tail` would reach `head`.
pub(crate) fn chunk_overflows(head: u64, tail: u64, capacity: u64) -> bool {
    (tail + CHUNK_WORDS) & (capacity - 1) == head
}

pub(crate) fn region_of(set: &Storeset) -> Arc<PmemRegion> {
    Arc::clone(set.context().region())
}
