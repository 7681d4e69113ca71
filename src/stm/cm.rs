#![forbid(unsafe_code)]
//! Contention management: what a transaction does between a conflict and
//! its next attempt.

use std::hint::spin_loop;
use std::thread;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::ContentionPolicy;
use crate::types::RestartReason;

use super::locks::{LockState, LockTable};

const MIN_BACKOFF: u64 = 1 << 2;
const MAX_BACKOFF: u64 = 1 << 31;

/// Per-descriptor contention state.
#[derive(Debug)]
pub struct ContentionManager {
    policy: ContentionPolicy,
    backoff: u64,
    rng: SmallRng,
}

impl ContentionManager {
    /// Manager for `policy`; `seed` feeds the backoff randomization.
    pub fn new(policy: ContentionPolicy, seed: u64) -> Self {
        Self {
            policy,
            backoff: MIN_BACKOFF,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Policy in use.
    pub fn policy(&self) -> ContentionPolicy {
        self.policy
    }

    /// Called after a rollback, before the next attempt. `contended` is the
    /// lock the attempt tripped over, if any.
    pub fn before_retry(&mut self, reason: RestartReason, contended: Option<(&LockTable, usize)>) {
        match self.policy {
            ContentionPolicy::Suicide => {}
            ContentionPolicy::Delay => {
                if let Some((locks, index)) = contended {
                    while matches!(LockState::decode(locks.load(index)), LockState::Owned { .. }) {
                        thread::yield_now();
                    }
                }
            }
            ContentionPolicy::Backoff => {
                if reason == RestartReason::Reallocate {
                    return;
                }
                let wait = self.rng.gen_range(0..self.backoff);
                for _ in 0..wait {
                    spin_loop();
                }
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    /// Called after a successful commit.
    pub fn on_commit(&mut self) {
        self.backoff = MIN_BACKOFF;
    }

    /// Current backoff ceiling in spin iterations.
    pub fn backoff(&self) -> u64 {
        self.backoff
    }
}
