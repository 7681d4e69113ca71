#![forbid(unsafe_code)]
//! CRC32 over region images.

/// CRC over a region image: its length, then every word in little-endian order.
pub fn image_crc32<I>(len: u64, words: I) -> u32
where
    I: IntoIterator<Item = u64>,
{
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    for word in words {
        hasher.update(&word.to_le_bytes());
    }
    hasher.finalize()
}
