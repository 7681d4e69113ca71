#![forbid(unsafe_code)]
//! Emulated persistent memory region and its on-disk image format.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::bytes::mask;
use crate::primitives::io::FileIo;
use crate::types::{image_crc32, MnemoError, PAddr, Result};

mod segment;

pub use segment::{Segment, SEGMENT_DIR_CAPACITY};

/// Granularity of region sizes and segment placement.
pub const PAGE_SIZE: u64 = 4096;

const IMAGE_MAGIC: [u8; 8] = *b"MNEMOIMG";
const IMAGE_FORMAT_VERSION: u16 = 1;
const IMAGE_HEADER_LEN: usize = 32;

/// A byte range standing in for persistent memory.
///
/// Storage is a slice of atomic words so that any thread may load and store
/// concurrently; unaligned word accesses are split across the two words they
/// touch. Whether a write is durable is tracked elsewhere, by the storesets.
pub struct PmemRegion {
    words: Box<[AtomicU64]>,
    len: u64,
    dir_lock: Mutex<()>,
}

impl PmemRegion {
    /// Creates a zeroed region of at least `len` bytes, rounded up to a page.
    pub fn new(len: u64) -> Result<Self> {
        if len == 0 {
            return Err(MnemoError::Invalid("region length must be non-zero"));
        }
        let len = len
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(MnemoError::Invalid("region length overflow"))?;
        let words = (0..len / 8).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            words,
            len,
            dir_lock: Mutex::new(()),
        })
    }

    /// Size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the region has no bytes; never the case for a built region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when `[addr, addr + size)` lies inside the region.
    pub fn contains(&self, addr: PAddr, size: u64) -> bool {
        addr.0
            .checked_add(size)
            .map(|end| end <= self.len)
            .unwrap_or(false)
    }

    fn check(&self, addr: PAddr, size: u64) -> Result<()> {
        if self.contains(addr, size) {
            Ok(())
        } else {
            Err(MnemoError::InvalidOwned(format!(
                "address {addr} (+{size}) outside persistent region of {} bytes",
                self.len
            )))
        }
    }

    /// Loads the 8 bytes at `addr`, which need not be aligned.
    pub fn load(&self, addr: PAddr) -> Result<u64> {
        self.check(addr, 8)?;
        let idx = (addr.0 / 8) as usize;
        let shift = (addr.0 % 8) as u32;
        let lo = self.words[idx].load(Ordering::Acquire);
        if shift == 0 {
            return Ok(lo);
        }
        let hi = self.words[idx + 1].load(Ordering::Acquire);
        let bits = shift * 8;
        Ok((lo >> bits) | (hi << (64 - bits)))
    }

    /// Stores the 8 bytes at `addr`.
    pub fn store(&self, addr: PAddr, val: u64) -> Result<()> {
        self.store_masked(addr, val, mask::FULL)
    }

    /// Stores only the bits of `val` selected by `mask` at `addr`.
    pub fn store_masked(&self, addr: PAddr, val: u64, mask: u64) -> Result<()> {
        self.check(addr, 8)?;
        if mask == 0 {
            return Ok(());
        }
        let idx = (addr.0 / 8) as usize;
        let shift = (addr.0 % 8) as u32;
        if shift == 0 {
            self.merge_word(idx, val, mask);
            return Ok(());
        }
        let ((lo_v, lo_m), (hi_v, hi_m)) = mask::split_unaligned(val, mask, shift);
        self.merge_word(idx, lo_v, lo_m);
        self.merge_word(idx + 1, hi_v, hi_m);
        Ok(())
    }

    fn merge_word(&self, idx: usize, val: u64, m: u64) {
        if m == mask::FULL {
            self.words[idx].store(val, Ordering::Release);
        } else if m != 0 {
            let _ = self.words[idx].fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some(mask::apply(old, val, m))
            });
        }
    }

    /// Loads one byte.
    pub fn load_byte(&self, addr: PAddr) -> Result<u8> {
        self.check(addr, 1)?;
        let word = self.words[(addr.0 / 8) as usize].load(Ordering::Acquire);
        Ok((word >> ((addr.0 % 8) * 8)) as u8)
    }

    /// Stores one byte.
    pub fn store_byte(&self, addr: PAddr, byte: u8) -> Result<()> {
        self.check(addr, 1)?;
        let shift = (addr.0 % 8) * 8;
        self.merge_word(
            (addr.0 / 8) as usize,
            (byte as u64) << shift,
            0xffu64 << shift,
        );
        Ok(())
    }

    /// Copies `dst.len()` bytes starting at `addr`.
    pub fn read_bytes(&self, addr: PAddr, dst: &mut [u8]) -> Result<()> {
        self.check(addr, dst.len() as u64)?;
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.load_byte(addr.add(i as u64))?;
        }
        Ok(())
    }

    /// Writes `src` starting at `addr`, bypassing any durability tracking.
    pub fn write_bytes(&self, addr: PAddr, src: &[u8]) -> Result<()> {
        self.check(addr, src.len() as u64)?;
        for (i, &byte) in src.iter().enumerate() {
            self.store_byte(addr.add(i as u64), byte)?;
        }
        Ok(())
    }

    /// Copies the current contents into a new region.
    pub fn snapshot(&self) -> PmemRegion {
        let words = self
            .words
            .iter()
            .map(|w| AtomicU64::new(w.load(Ordering::Acquire)))
            .collect();
        PmemRegion {
            words,
            len: self.len,
            dir_lock: Mutex::new(()),
        }
    }

    /// Writes the region to `io` as a checksummed image.
    pub fn save_image(&self, io: &dyn FileIo) -> Result<()> {
        let words: Vec<u64> = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect();
        let header = encode_image_header(self.len, image_crc32(self.len, words.iter().copied()));
        let mut body = Vec::with_capacity(words.len() * 8);
        for w in &words {
            body.extend_from_slice(&w.to_le_bytes());
        }
        io.truncate(0)?;
        io.write_at(0, &header)?;
        io.write_at(IMAGE_HEADER_LEN as u64, &body)?;
        io.sync_all()?;
        debug!(bytes = self.len, "region.save_image");
        Ok(())
    }

    /// Rebuilds a region from an image written by [`PmemRegion::save_image`].
    pub fn load_image(io: &dyn FileIo) -> Result<PmemRegion> {
        let mut header = [0u8; IMAGE_HEADER_LEN];
        io.read_at(0, &mut header)?;
        let (len, stored_crc) = decode_image_header(&header)?;
        let body_len = io.len()?.saturating_sub(IMAGE_HEADER_LEN as u64);
        if len != body_len {
            return Err(MnemoError::Corruption("region image length does not match file"));
        }
        let mut body = vec![0u8; len as usize];
        io.read_at(IMAGE_HEADER_LEN as u64, &mut body)?;
        let words: Vec<u64> = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        if image_crc32(len, words.iter().copied()) != stored_crc {
            return Err(MnemoError::Corruption("region image crc mismatch"));
        }
        debug!(bytes = len, "region.load_image");
        Ok(PmemRegion {
            words: words.into_iter().map(AtomicU64::new).collect(),
            len,
            dir_lock: Mutex::new(()),
        })
    }
}

fn encode_image_header(len: u64, crc: u32) -> [u8; IMAGE_HEADER_LEN] {
    let mut buf = [0u8; IMAGE_HEADER_LEN];
    buf[0..8].copy_from_slice(&IMAGE_MAGIC);
    buf[8..10].copy_from_slice(&IMAGE_FORMAT_VERSION.to_be_bytes());
    buf[16..24].copy_from_slice(&len.to_be_bytes());
    buf[24..28].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn decode_image_header(src: &[u8; IMAGE_HEADER_LEN]) -> Result<(u64, u32)> {
    if src[0..8] != IMAGE_MAGIC {
        return Err(MnemoError::Corruption("region image magic mismatch"));
    }
    let version = u16::from_be_bytes([src[8], src[9]]);
    if version != IMAGE_FORMAT_VERSION {
        return Err(MnemoError::Corruption("region image version mismatch"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&src[16..24]);
    let len = u64::from_be_bytes(len_bytes);
    if len == 0 || len % PAGE_SIZE != 0 {
        return Err(MnemoError::Corruption("region image length invalid"));
    }
    let crc = u32::from_be_bytes([src[24], src[25], src[26], src[27]]);
    Ok((len, crc))
}
