#![forbid(unsafe_code)]
//! Word, mask and bit-packing helpers shared by the emulator and the logs.

/// Size of the machine word every store operates on.
pub const WORD_SIZE: u64 = 8;

pub mod mask {
    //! Byte masks over a 64-bit word, little-endian byte order.

    use crate::types::{MnemoError, Result};

    /// Mask selecting every bit of a word.
    pub const FULL: u64 = u64::MAX;

    /// Merges `val` into `old`, taking only the bits selected by `mask`.
    #[inline]
    pub fn apply(old: u64, val: u64, mask: u64) -> u64 {
        (old & !mask) | (val & mask)
    }

    /// Mask covering `len` bytes starting at byte `first` of a word.
    pub fn bytes(first: u32, len: u32) -> Result<u64> {
        if !matches!(first.checked_add(len), Some(end) if end <= 8) {
            return Err(MnemoError::Invalid("byte range exceeds word"));
        }
        if len == 0 {
            return Ok(0);
        }
        let span = if len == 8 {
            u64::MAX
        } else {
            (1u64 << (len * 8)) - 1
        };
        Ok(span << (first * 8))
    }

    /// Splits a word access at byte offset `shift` (1..=7) of an aligned word
    /// into the parts landing in the low and the high aligned word.
    pub fn split_unaligned(val: u64, mask: u64, shift: u32) -> ((u64, u64), (u64, u64)) {
        debug_assert!((1..8).contains(&shift));
        let bits = shift * 8;
        let lo = (val << bits, mask << bits);
        let hi = (val >> (64 - bits), mask >> (64 - bits));
        (lo, hi)
    }
}

pub mod torn {
    //! Packing of 64-bit values into 63-bit payload slots.
    //!
    //! The top bit of every slot is reserved for the torn bit, so a stream of
    //! 64-bit values spills one extra bit per value into the next slot. After
    //! 63 values the carried remainder fills a whole slot on its own.

    /// Bit reserved in every slot for the wrap parity.
    pub const TORN_BIT: u64 = 1 << 63;
    /// Payload bits of a slot.
    pub const PAYLOAD_MASK: u64 = !TORN_BIT;

    /// Writer-side carry: bits of earlier values not yet placed in a slot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Carry {
        /// Pending bits, right-aligned.
        pub bits: u64,
        /// Number of pending bits (0..=63).
        pub len: u32,
    }

    /// Result of packing one value.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Packed {
        /// Payload for the current slot.
        pub slot: u64,
        /// Payload for an extra slot, produced when the carry was full.
        pub spill: Option<u64>,
    }

    impl Carry {
        /// Packs `value`, returning the slot payloads and advancing the carry.
        pub fn pack(&mut self, value: u64) -> Packed {
            if self.len == 63 {
                let slot = self.bits & PAYLOAD_MASK;
                let spill = value & PAYLOAD_MASK;
                self.bits = value >> 63;
                self.len = 1;
                return Packed {
                    slot,
                    spill: Some(spill),
                };
            }
            let slot = (self.bits | (value << self.len)) & PAYLOAD_MASK;
            self.len += 1;
            self.bits = value >> (64 - self.len);
            Packed { slot, spill: None }
        }

        /// Payload carrying the pending bits, if any, and resets the carry.
        pub fn drain(&mut self) -> Option<u64> {
            if self.len == 0 {
                return None;
            }
            let slot = self.bits & PAYLOAD_MASK;
            *self = Carry::default();
            Some(slot)
        }
    }

    /// Reassembles the value starting `offset` bits into slot `first`.
    ///
    /// Returns the value, the number of whole slots consumed, and the new bit
    /// offset.
    pub fn unpack(first: u64, second: u64, offset: u32) -> (u64, u64, u32) {
        debug_assert!(offset < 63);
        let value = ((first & PAYLOAD_MASK) >> offset) | (second << (63 - offset));
        let next = offset + 1;
        if next == 63 {
            (value, 2, 0)
        } else {
            (value, 1, next)
        }
    }
}
