#![forbid(unsafe_code)]
//! Shared identifiers and the crate-wide error type.

use std::fmt;

pub mod checksum;

pub use checksum::image_crc32;

/// Byte offset into an emulated persistent region.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PAddr(pub u64);

/// Persisted tag identifying which operations own a log slot.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LogType(pub u16);

/// Replay/truncation priority reported by a log; lower goes first.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LogOrder(pub u64);

/// Why a transaction had to abort and start over.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// Read hit a lock owned by another transaction.
    LockedRead,
    /// Write hit a lock owned by another transaction.
    LockedWrite,
    /// Read saw a newer version and the snapshot could not be extended.
    ValidateRead,
    /// Write saw a newer version of a location already read.
    ValidateWrite,
    /// Commit-time validation failed.
    ValidateCommit,
    /// Read or write set outgrew its capacity and was enlarged.
    Reallocate,
    /// The application asked to run the transaction again.
    UserRetry,
}

impl RestartReason {
    /// All reasons, in reporting order.
    pub const ALL: [RestartReason; 7] = [
        RestartReason::LockedRead,
        RestartReason::LockedWrite,
        RestartReason::ValidateRead,
        RestartReason::ValidateWrite,
        RestartReason::ValidateCommit,
        RestartReason::Reallocate,
        RestartReason::UserRetry,
    ];

    /// Stable short name used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            RestartReason::LockedRead => "locked_read",
            RestartReason::LockedWrite => "locked_write",
            RestartReason::ValidateRead => "validate_read",
            RestartReason::ValidateWrite => "validate_write",
            RestartReason::ValidateCommit => "validate_commit",
            RestartReason::Reallocate => "reallocate",
            RestartReason::UserRetry => "user_retry",
        }
    }
}

/// Errors produced by the emulation layer, the logs and the transaction engine.
#[derive(thiserror::Error, Debug)]
pub enum MnemoError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persistent state does not match its expected layout.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller broke an API contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller broke an API contract; message built at runtime.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Lookup found nothing.
    #[error("not found")]
    NotFound,
    /// The physical log has no room for the next chunk.
    #[error("log full")]
    LogFull,
    /// A log reader drained everything durable.
    #[error("no data")]
    NoData,
    /// The shadow table hit its capacity.
    #[error("shadow table exhausted")]
    ShadowExhausted,
    /// Transaction must abort and run again.
    #[error("transaction restart: {}", .0.as_str())]
    Restart(RestartReason),
    /// Transaction was aborted by the application.
    #[error("transaction aborted by user")]
    UserAbort,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MnemoError>;

impl PAddr {
    /// Offset by `bytes`.
    pub fn add(self, bytes: u64) -> PAddr {
        PAddr(self.0 + bytes)
    }

    /// Address of the `index`-th word after this one.
    pub fn word(self, index: u64) -> PAddr {
        PAddr(self.0 + index * 8)
    }

    /// Start of the block of `1 << log` bytes containing this address.
    pub fn align_down(self, log: u32) -> PAddr {
        PAddr(self.0 & !((1u64 << log) - 1))
    }

    /// True when the address is a multiple of 8.
    pub fn is_word_aligned(self) -> bool {
        self.0 & 7 == 0
    }
}

impl LogType {
    /// Tag of a slot no type has claimed.
    pub const FREE: LogType = LogType(0);
}

impl LogOrder {
    /// Marker for "nothing to replay or truncate".
    pub const INVALID: LogOrder = LogOrder(u64::MAX);

    /// True unless this is [`LogOrder::INVALID`].
    pub fn is_valid(self) -> bool {
        self != LogOrder::INVALID
    }
}

impl fmt::Display for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PAddr {
    fn from(value: u64) -> Self {
        PAddr(value)
    }
}

impl From<PAddr> for u64 {
    fn from(value: PAddr) -> Self {
        value.0
    }
}
