#![forbid(unsafe_code)]
//! Statistics sink fed by the commit, abort and log paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::types::RestartReason;

/// What a counter increment is about.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StatTag {
    /// A transaction committed.
    Commit,
    /// A transaction was aborted by the application.
    Abort,
    /// A transactional store was buffered.
    Write,
    /// A transactional load was served.
    Read,
    /// A transaction restarted for the given reason.
    Restart(RestartReason),
    /// A transactional log record was flushed.
    LogFlush,
    /// A truncation pass ran.
    Truncation,
    /// A writer waited for the background truncation thread.
    WaitForTruncation,
}

/// Receives counter increments. Implementations must be cheap.
pub trait StatsSink: Send + Sync {
    /// Adds `n` to the counter named by `tag`.
    fn increment(&self, tag: StatTag, n: u64);
}

/// Discards everything.
#[derive(Default, Debug)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn increment(&self, _tag: StatTag, _n: u64) {}
}

/// Atomic counters for every tag.
#[derive(Default, Debug)]
pub struct CounterStats {
    commits: AtomicU64,
    aborts: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    restarts: [AtomicU64; RestartReason::ALL.len()],
    log_flushes: AtomicU64,
    truncations: AtomicU64,
    truncation_waits: AtomicU64,
}

/// Point-in-time copy of [`CounterStats`].
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Committed transactions.
    pub commits: u64,
    /// User aborts.
    pub aborts: u64,
    /// Buffered stores.
    pub writes: u64,
    /// Transactional loads.
    pub reads: u64,
    /// Restarts per reason, in [`RestartReason::ALL`] order.
    pub restarts: Vec<(RestartReason, u64)>,
    /// Log record flushes.
    pub log_flushes: u64,
    /// Truncation passes.
    pub truncations: u64,
    /// Waits for the truncation thread.
    pub truncation_waits: u64,
}

impl StatsSnapshot {
    /// Restarts summed over every reason.
    pub fn total_restarts(&self) -> u64 {
        self.restarts.iter().map(|(_, n)| n).sum()
    }

    /// Restarts for one reason.
    pub fn restarts_for(&self, reason: RestartReason) -> u64 {
        self.restarts
            .iter()
            .find(|(r, _)| *r == reason)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

fn reason_index(reason: RestartReason) -> usize {
    RestartReason::ALL
        .iter()
        .position(|r| *r == reason)
        .unwrap_or(0)
}

impl CounterStats {
    /// Reads every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            restarts: RestartReason::ALL
                .iter()
                .map(|&r| (r, self.restarts[reason_index(r)].load(Ordering::Relaxed)))
                .collect(),
            log_flushes: self.log_flushes.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
            truncation_waits: self.truncation_waits.load(Ordering::Relaxed),
        }
    }
}

impl StatsSink for CounterStats {
    fn increment(&self, tag: StatTag, n: u64) {
        let counter = match tag {
            StatTag::Commit => &self.commits,
            StatTag::Abort => &self.aborts,
            StatTag::Write => &self.writes,
            StatTag::Read => &self.reads,
            StatTag::Restart(reason) => &self.restarts[reason_index(reason)],
            StatTag::LogFlush => &self.log_flushes,
            StatTag::Truncation => &self.truncations,
            StatTag::WaitForTruncation => &self.truncation_waits,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// The default sink, [`NoopStats`].
pub fn default_stats() -> Arc<dyn StatsSink> {
    Arc::new(NoopStats)
}
