#![forbid(unsafe_code)]
//! Versioned lock table and global commit clock.
//!
//! A lock word is either `version << 1` (unlocked) or
//! `1 | owner << 1 | entry << OWNER_END` (owned), where `owner` is the
//! transaction id and `entry` the index of the first write-set entry the
//! owner hung under this lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::PAddr;

const OWNED_BIT: u64 = 1;
const OWNER_BITS: u32 = 23;
const OWNER_END: u32 = OWNER_BITS + 1;

/// Largest transaction id a lock word can name.
pub const MAX_OWNER: u32 = (1 << OWNER_BITS) - 1;

/// Decoded lock word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Free; last committed at `version`.
    Unlocked(u64),
    /// Held by transaction `owner`; its chain starts at write-set `entry`.
    Owned {
        /// Transaction id.
        owner: u32,
        /// First write-set entry under this lock.
        entry: usize,
    },
}

impl LockState {
    /// Decodes a raw lock word.
    pub fn decode(word: u64) -> Self {
        if word & OWNED_BIT == 0 {
            LockState::Unlocked(word >> 1)
        } else {
            LockState::Owned {
                owner: ((word >> 1) & u64::from(MAX_OWNER)) as u32,
                entry: (word >> OWNER_END) as usize,
            }
        }
    }

    /// Raw word of an owned lock.
    pub fn owned(owner: u32, entry: usize) -> u64 {
        OWNED_BIT | (u64::from(owner & MAX_OWNER) << 1) | ((entry as u64) << OWNER_END)
    }

    /// Raw word of an unlocked lock at `version`.
    pub fn unlocked(version: u64) -> u64 {
        version << 1
    }
}

/// Array of versioned locks, addressed by hashing word addresses.
#[derive(Debug)]
pub struct LockTable {
    locks: Box<[AtomicU64]>,
    mask: u64,
}

impl LockTable {
    /// Table of `1 << log_size` unlocked locks at version 0.
    pub fn new(log_size: u32) -> Self {
        let len = 1usize << log_size;
        Self {
            locks: (0..len).map(|_| AtomicU64::new(0)).collect(),
            mask: len as u64 - 1,
        }
    }

    /// Number of locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Always false; a table has at least one lock.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Lock covering the word at `addr`.
    pub fn index_of(&self, addr: PAddr) -> usize {
        ((addr.0 >> 3) & self.mask) as usize
    }

    /// Current raw word of lock `index`.
    pub fn load(&self, index: usize) -> u64 {
        self.locks[index].load(Ordering::Acquire)
    }

    /// Tries to move lock `index` from `current` to `new`.
    pub fn cas(&self, index: usize, current: u64, new: u64) -> bool {
        self.locks[index]
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publishes `word` into lock `index`; used by the owner to release.
    pub fn release(&self, index: usize, word: u64) {
        self.locks[index].store(word, Ordering::Release);
    }
}

/// Global version clock; every commit takes a unique tick.
#[derive(Debug, Default)]
pub struct Clock(AtomicU64);

impl Clock {
    /// Clock starting at `value`.
    pub fn starting_at(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Latest issued timestamp.
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Issues the next commit timestamp.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}
