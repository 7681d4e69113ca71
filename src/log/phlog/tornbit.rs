#![forbid(unsafe_code)]
//! Log encoding that marks every slot with the parity of the current wrap.
//!
//! Metadata: `[generic_flags, flags, reserved, reserved]` where `flags`
//! holds the head index in its low 32 bits and the parity expected at the
//! head in its top bit. Values are bit-packed into 63-bit payloads, so a
//! value may straddle two slots.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    chunk_overflows, free_words, region_of, ChunkBuffer, LogSlot, PhlogStats, PhysicalLog,
    CHUNK_WORDS,
};
use crate::pcm::Storeset;
use crate::primitives::bytes::torn::{self, Carry, TORN_BIT};
use crate::primitives::region::PmemRegion;
use crate::types::{MnemoError, Result};

const NVMD_FLAGS: u64 = 1;
const HEAD_MASK: u64 = 0xFFFF_FFFF;

/// Log whose durable extent is recovered from slot parity.
pub struct TornbitLog {
    slot: LogSlot,
    region: Arc<PmemRegion>,
    buffer: ChunkBuffer,
    carry: Carry,
    tornbit: u64,
    stable_tornbit: u64,
    head: u64,
    tail: u64,
    stable_tail: u64,
    read_index: u64,
    read_offset: u32,
    chunk_writes: u64,
}

impl std::fmt::Debug for TornbitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TornbitLog")
            .field("slot", &self.slot.index)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("stable_tail", &self.stable_tail)
            .field("read_index", &self.read_index)
            .field("tornbit", &(self.tornbit != 0))
            .finish()
    }
}

impl TornbitLog {
    /// Empties `slot`: head 0 expecting parity one, every slot parity zero.
    pub fn format(set: &mut Storeset, slot: &LogSlot) -> Result<()> {
        slot.validate()?;
        let region = region_of(set);
        set.nt_store(slot.nvmd_word(NVMD_FLAGS), TORN_BIT)?;
        for i in 0..slot.words {
            let addr = slot.data_word(i);
            if region.load(addr)? & TORN_BIT != 0 {
                set.nt_store(addr, 0)?;
            }
        }
        set.nt_flush()?;
        debug!(slot = slot.index, "phlog.tornbit.format");
        Ok(())
    }

    /// Opens `slot` with every cursor at the persisted head. Call
    /// [`PhysicalLog::check_consistency`] before reading or writing.
    pub fn open(set: &Storeset, slot: LogSlot) -> Result<Self> {
        slot.validate()?;
        let region = region_of(set);
        let flags = region.load(slot.nvmd_word(NVMD_FLAGS))?;
        let head = (flags & HEAD_MASK) & (slot.words - 1);
        Ok(Self {
            slot,
            region,
            buffer: ChunkBuffer::default(),
            carry: Carry::default(),
            tornbit: flags & TORN_BIT,
            stable_tornbit: flags & TORN_BIT,
            head,
            tail: head,
            stable_tail: head,
            read_index: head,
            read_offset: 0,
            chunk_writes: 0,
        })
    }

    fn mask(&self) -> u64 {
        self.slot.words - 1
    }

    fn emit_chunk(&mut self, set: &mut Storeset) -> Result<()> {
        self.buffer.emit(set, &self.slot, self.tail, self.tornbit)?;
        self.tail = (self.tail + CHUNK_WORDS) & self.mask();
        if self.tail == 0 {
            self.tornbit ^= TORN_BIT;
        }
        self.chunk_writes += 1;
        Ok(())
    }

    fn publish_head(&self, set: &mut Storeset, tornbit: u64) -> Result<()> {
        set.nt_store(self.slot.nvmd_word(NVMD_FLAGS), self.head | tornbit)?;
        set.nt_flush()
    }

    fn slot_at(&self, index: u64) -> Result<u64> {
        self.region.load(self.slot.data_word(index))
    }
}

impl PhysicalLog for TornbitLog {
    fn write(&mut self, set: &mut Storeset, value: u64) -> Result<()> {
        let slots = if self.carry.len == 63 { 2 } else { 1 };
        if self.buffer.len() + slots >= CHUNK_WORDS as usize
            && chunk_overflows(self.head, self.tail, self.slot.words)
        {
            return Err(MnemoError::LogFull);
        }
        let packed = self.carry.pack(value);
        self.buffer.push(packed.slot);
        if self.buffer.is_full() {
            self.emit_chunk(set)?;
        }
        if let Some(spill) = packed.spill {
            self.buffer.push(spill);
            if self.buffer.is_full() {
                self.emit_chunk(set)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self, set: &mut Storeset) -> Result<()> {
        if self.carry.len > 0 || self.buffer.len() > 0 {
            if chunk_overflows(self.head, self.tail, self.slot.words) {
                return Err(MnemoError::LogFull);
            }
            if let Some(rest) = self.carry.drain() {
                self.buffer.push(rest);
            }
            self.emit_chunk(set)?;
        }
        self.stable_tail = self.tail;
        self.stable_tornbit = self.tornbit;
        set.seq_flush()
    }

    fn read(&mut self) -> Result<u64> {
        let next = (self.read_index + 1) & self.mask();
        if self.read_index == self.stable_tail || next == self.stable_tail {
            return Err(MnemoError::NoData);
        }
        let first = self.slot_at(self.read_index)?;
        let second = self.slot_at(next)?;
        let (value, used, offset) = torn::unpack(first, second, self.read_offset);
        self.read_index = (self.read_index + used) & self.mask();
        self.read_offset = offset;
        Ok(value)
    }

    fn stable_exists(&self) -> bool {
        self.read_index != self.stable_tail
    }

    fn next_chunk(&mut self) {
        let start = self.read_index & !(CHUNK_WORDS - 1);
        if self.read_offset > 0 || start != self.read_index {
            self.read_index = (start + CHUNK_WORDS) & self.mask();
        }
        self.read_offset = 0;
    }

    fn checkpoint(&self) -> Result<u64> {
        if self.read_offset > 0 {
            return Err(MnemoError::Invalid("checkpoint inside a packed value"));
        }
        Ok(self.read_index)
    }

    fn restore(&mut self, mark: u64) {
        self.read_index = mark & self.mask();
        self.read_offset = 0;
    }

    fn truncate_sync(&mut self, set: &mut Storeset) -> Result<()> {
        self.head = self.tail;
        self.read_index = self.head;
        self.read_offset = 0;
        self.stable_tail = self.tail;
        self.publish_head(set, self.tornbit)
    }

    fn truncate_async(&mut self, set: &mut Storeset) -> Result<()> {
        if self.read_index % CHUNK_WORDS != 0 || self.read_offset > 0 {
            return Err(MnemoError::Invalid("truncation point must start a chunk"));
        }
        let mut tornbit = self.region.load(self.slot.nvmd_word(NVMD_FLAGS))? & TORN_BIT;
        if self.head > self.read_index {
            tornbit ^= TORN_BIT;
        }
        self.head = self.read_index;
        self.publish_head(set, tornbit)
    }

    fn rewind_writer(&mut self) {
        self.tail = self.stable_tail;
        self.tornbit = self.stable_tornbit;
        self.buffer = ChunkBuffer::default();
        self.carry = Carry::default();
    }

    fn check_consistency(&mut self) -> Result<u64> {
        let flags = self.region.load(self.slot.nvmd_word(NVMD_FLAGS))?;
        let head = (flags & HEAD_MASK) & self.mask();
        let mut expected = flags & TORN_BIT;
        let mut i = head;
        loop {
            if self.slot_at(i)? & TORN_BIT != expected {
                break;
            }
            i = (i + 1) & self.mask();
            if i == 0 {
                expected ^= TORN_BIT;
            }
            if i == head {
                break;
            }
        }
        let stable = i & !(CHUNK_WORDS - 1);
        if stable != i {
            warn!(
                slot = self.slot.index,
                torn_at = i,
                stable,
                "phlog.tornbit.torn_chunk"
            );
        }
        self.head = head;
        self.tail = stable;
        self.stable_tail = stable;
        self.read_index = head;
        self.read_offset = 0;
        self.tornbit = expected;
        self.stable_tornbit = expected;
        self.buffer = ChunkBuffer::default();
        self.carry = Carry::default();
        debug!(slot = self.slot.index, head, stable, "phlog.tornbit.consistency");
        Ok(stable)
    }

    fn stats(&self) -> PhlogStats {
        PhlogStats {
            head: self.head,
            tail: self.tail,
            stable_tail: self.stable_tail,
            read_index: self.read_index,
            capacity: self.slot.words,
            free_words: free_words(self.head, self.tail, self.slot.words),
            chunk_writes: self.chunk_writes,
        }
    }
}
