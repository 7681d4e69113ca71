//! Low-level primitives for building the emulator.
//!
//! Includes word and bit-packing utilities, file I/O for region images, and
//! the emulated persistent region itself.

/// Word masks and torn-bit packing.
///
/// Bit-level helpers used by masked stores and by the torn-bit log encoding.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes used to save and reload region images.
pub mod io;

/// Emulated persistent memory.
///
/// The word-addressed byte range that survives simulated restarts, plus the
/// segment directory that lets callers find their allocations again.
pub mod region;
