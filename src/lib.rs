//! Persistent-memory emulation and durable transactional memory.
//!
//! `mnemo` emulates byte-addressable persistent memory on DRAM. Writes go
//! through per-thread storesets that remember which bytes are not yet
//! durable, so a simulated crash can roll them back. On top of that sits a
//! write-back software transactional memory whose commits are made
//! crash-safe by a redo log kept in circular physical logs.

#![warn(missing_docs)]

pub mod config;
pub mod log;
pub mod metrics;
pub mod pcm;
pub mod primitives;
pub mod runtime;
pub mod stm;
pub mod types;

pub use config::{MnemoConfig, PcmConfig, StmConfig};
pub use runtime::Runtime;
pub use types::{MnemoError, PAddr, Result};
