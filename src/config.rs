#![forbid(unsafe_code)]
//! Process-wide tunables and their TOML loader.
//!
//! Every knob has a default; a config file only needs to name what it
//! changes. Values are checked by [`MnemoConfig::validate`] before use.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of outcomes every probability is expressed against.
pub const TOTAL_OUTCOMES: u32 = 1_000_000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Emulation knobs: geometry, latency, crash behavior and log pool shape.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PcmConfig {
    /// log2 of the cacheline size in bytes (3..=6).
    pub cacheline_size_log: u32,
    /// Store granularity in bytes; only 8 is supported.
    pub word_size: u32,
    /// Emulated CPU frequency used to convert latencies to cycles.
    pub cpu_freq_mhz: u64,
    /// Latency of one write reaching persistent memory.
    pub write_latency_ns: u64,
    /// Banks written in parallel by a sequential stream.
    pub memory_banking_factor: u32,
    /// Chance out of [`TOTAL_OUTCOMES`] that a write-back store stalls.
    pub likelihood_store_blockwaits: u32,
    /// Chance out of [`TOTAL_OUTCOMES`] that a dirty line was evicted before a crash.
    pub likelihood_evicted_cacheline: u32,
    /// Weight of "exactly i words of the line survived", for i in 0..=words per line.
    pub crash_cdf: Vec<u32>,
    /// Number of write-combining buffers.
    pub wcbuf_capacity: u32,
    /// Spin to emulate write latency.
    pub latency_enabled: bool,
    /// Track undurable bytes so crashes can roll them back.
    pub crash_emulation: bool,
    /// Maximum dirty lines a storeset remembers.
    pub shadow_capacity: usize,
    /// Number of log slots in the pool.
    pub log_pool_slots: u32,
    /// Words per physical log; a power of two.
    pub log_slot_words: u64,
    /// Size of the emulated persistent region in bytes.
    pub region_bytes: u64,
}

impl Default for PcmConfig {
    fn default() -> Self {
        Self {
            cacheline_size_log: 6,
            word_size: 8,
            cpu_freq_mhz: 2500,
            write_latency_ns: 150,
            memory_banking_factor: 4,
            likelihood_store_blockwaits: 1000,
            likelihood_evicted_cacheline: 10_000,
            crash_cdf: no_partial_cdf(8),
            wcbuf_capacity: 8,
            latency_enabled: false,
            crash_emulation: true,
            shadow_capacity: 1 << 20,
            log_pool_slots: 32,
            log_slot_words: 1 << 16,
            region_bytes: 64 << 20,
        }
    }
}

/// CDF putting all mass on "every word made it".
pub fn no_partial_cdf(words_per_line: usize) -> Vec<u32> {
    let mut cdf = vec![0; words_per_line + 1];
    cdf[words_per_line] = TOTAL_OUTCOMES;
    cdf
}

/// CDF putting all mass on "exactly `k` words made it".
pub fn exact_cdf(words_per_line: usize, k: usize) -> Vec<u32> {
    let mut cdf = vec![0; words_per_line + 1];
    cdf[k.min(words_per_line)] = TOTAL_OUTCOMES;
    cdf
}

impl PcmConfig {
    /// Bytes per cacheline.
    pub fn cacheline_size(&self) -> u64 {
        1 << self.cacheline_size_log
    }

    /// Words per cacheline.
    pub fn words_per_line(&self) -> usize {
        (self.cacheline_size() / self.word_size as u64) as usize
    }

    /// Checks ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(3..=6).contains(&self.cacheline_size_log) {
            return invalid("pcm.cacheline_size_log", "must be between 3 and 6");
        }
        if self.word_size != 8 {
            return invalid("pcm.word_size", "only 8-byte words are supported");
        }
        if self.cpu_freq_mhz == 0 {
            return invalid("pcm.cpu_freq_mhz", "must be non-zero");
        }
        if self.likelihood_store_blockwaits > TOTAL_OUTCOMES
            || self.likelihood_evicted_cacheline > TOTAL_OUTCOMES
        {
            return invalid("pcm.likelihood_*", "must not exceed 1000000");
        }
        if self.crash_cdf.len() != self.words_per_line() + 1 {
            return Err(ConfigError::Invalid {
                field: "pcm.crash_cdf",
                reason: format!(
                    "expected {} entries, found {}",
                    self.words_per_line() + 1,
                    self.crash_cdf.len()
                ),
            });
        }
        let sum: u64 = self.crash_cdf.iter().map(|&w| w as u64).sum();
        if sum != TOTAL_OUTCOMES as u64 {
            return Err(ConfigError::Invalid {
                field: "pcm.crash_cdf",
                reason: format!("weights sum to {sum}, expected {TOTAL_OUTCOMES}"),
            });
        }
        if self.wcbuf_capacity == 0 {
            return invalid("pcm.wcbuf_capacity", "must be non-zero");
        }
        if !(self.memory_banking_factor as u64 * self.words_per_line() as u64).is_power_of_two() {
            return invalid(
                "pcm.memory_banking_factor",
                "banking factor times words per line must be a power of two",
            );
        }
        if self.shadow_capacity == 0 {
            return invalid("pcm.shadow_capacity", "must be non-zero");
        }
        if self.log_pool_slots == 0 {
            return invalid("pcm.log_pool_slots", "must be non-zero");
        }
        if !self.log_slot_words.is_power_of_two() || self.log_slot_words < 16 {
            return invalid("pcm.log_slot_words", "must be a power of two of at least 16");
        }
        if self.region_bytes == 0 {
            return invalid("pcm.region_bytes", "must be non-zero");
        }
        Ok(())
    }
}

/// Which physical log encoding transactions use.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Explicit head/tail words published with a fence.
    Base,
    /// Torn-bit parity per slot; no tail publish.
    Tornbit,
}

/// How a transaction reacts to a lock owned by someone else.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Abort and restart at once.
    Suicide,
    /// Wait for the contended lock to be released before restarting.
    Delay,
    /// Randomized exponential backoff before restarting.
    Backoff,
}

/// Whether transactions are isolated from each other.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Encounter-time locking on a shared lock table.
    Etl,
    /// Durability only; each descriptor uses a private lock table.
    None,
}

/// Transaction engine knobs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StmConfig {
    /// log2 of the number of lock slots.
    pub lock_array_log_size: u32,
    /// Initial read and write set capacity.
    pub rw_set_capacity: usize,
    /// Truncate the log at every commit instead of in the background.
    pub sync_truncation: bool,
    /// Physical log encoding.
    pub log_type: LogKind,
    /// Conflict policy.
    pub contention_manager: ContentionPolicy,
    /// Isolation mode.
    pub isolation: Isolation,
    /// Period of the background truncation pass.
    pub truncation_interval_ms: u64,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            lock_array_log_size: 16,
            rw_set_capacity: 64,
            sync_truncation: true,
            log_type: LogKind::Base,
            contention_manager: ContentionPolicy::Suicide,
            isolation: Isolation::Etl,
            truncation_interval_ms: 10_000,
        }
    }
}

impl StmConfig {
    /// Background truncation period.
    pub fn truncation_interval(&self) -> Duration {
        Duration::from_millis(self.truncation_interval_ms)
    }

    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(4..=28).contains(&self.lock_array_log_size) {
            return invalid("stm.lock_array_log_size", "must be between 4 and 28");
        }
        if self.rw_set_capacity == 0 {
            return invalid("stm.rw_set_capacity", "must be non-zero");
        }
        if self.truncation_interval_ms == 0 {
            return invalid("stm.truncation_interval_ms", "must be non-zero");
        }
        Ok(())
    }
}

/// Complete configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MnemoConfig {
    /// Emulation section.
    pub pcm: PcmConfig,
    /// Transaction section.
    pub stm: StmConfig,
}

impl MnemoConfig {
    /// Loads `explicit`, or the default path when `None`. A missing file
    /// yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let config = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => MnemoConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: MnemoConfig = toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates both sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pcm.validate()?;
        self.stm.validate()
    }
}

/// `<config dir>/mnemo/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mnemo").join("config.toml"))
}

fn read_file(path: &Path) -> Result<MnemoConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid<T>(field: &'static str, reason: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    })
}
