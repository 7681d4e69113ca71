#![forbid(unsafe_code)]
//! Durable logs: the physical ring encodings and the pool manager that hands
//! them out, recovers them after a restart and truncates them in the
//! background.

pub mod manager;
pub mod phlog;
mod truncation;

pub use manager::{
    LogHandle, LogManager, LogOps, ManagedLog, ManagerStats, ASYNC_TRUNCATION, LOG_POOL_FLAGS,
    TYPE_MASK,
};
pub use phlog::{BaseLog, LogSlot, PhlogStats, PhysicalLog, TornbitLog, CHUNK_WORDS};
