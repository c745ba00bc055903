// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration for `edt-rt` policy domains.
//!
//! Configuration is read from TOML. Every field has a default, so an empty document describes a
//! valid runtime with one worker per available CPU:
//!
//! ```toml
//! workers = 4
//! scheduler = "work-stealing"
//! deque-capacity = 32768
//! log-level = "debug"
//!
//! [heap]
//! size = 67108864
//!
//! [idle]
//! spin-rounds = 4
//! park-timeout-ms = 10
//! ```

use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, fs, thread};
use tracing::level_filters::LevelFilter;

fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
fn default_schedulers() -> usize {
    1
}
fn default_deque_capacity() -> usize {
    32768
}
fn default_guid_capacity() -> usize {
    1 << 20
}
fn default_heap_size() -> usize {
    64 * 1024 * 1024
}
fn default_spin_rounds() -> u32 {
    4
}
fn default_park_timeout_ms() -> u64 {
    10
}

/// A validated runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// The number of worker threads, including the one that calls `start`.
    pub workers: usize,
    /// The number of workpiles. Always equal to `workers`, every worker owns exactly one.
    pub workpiles: usize,
    /// The number of schedulers the workers are split between.
    pub schedulers: usize,
    /// Which scheduling policy to use.
    pub scheduler: SchedulerKind,
    /// The fixed number of slots in each workpile deque.
    pub deque_capacity: usize,
    /// The maximum number of live handles.
    pub guid_capacity: usize,
    pub heap: HeapConfig,
    pub idle: IdleConfig,
    /// The verbosity level of logging output
    pub log_level: LogLevel,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_workers")]
    workers: usize,
    workpiles: Option<usize>,
    #[serde(default = "default_schedulers")]
    schedulers: usize,
    #[serde(default)]
    scheduler: SchedulerKind,
    #[serde(default = "default_deque_capacity")]
    deque_capacity: usize,
    #[serde(default = "default_guid_capacity")]
    guid_capacity: usize,
    #[serde(default)]
    heap: HeapConfig,
    #[serde(default)]
    idle: IdleConfig,
    #[serde(default)]
    log_level: LogLevel,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HeapConfig {
    /// The size in bytes of the arena data blocks are carved from.
    #[serde(default = "default_heap_size")]
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IdleConfig {
    /// How many rounds of exponential spinning an idle worker does before parking.
    #[serde(default = "default_spin_rounds")]
    pub spin_rounds: u32,
    /// Upper bound on how long a parked worker sleeps before looking for work again.
    #[serde(default = "default_park_timeout_ms")]
    pub park_timeout_ms: u64,
}

/// The scheduling policies a policy domain can be configured with.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// Pop from the own workpile, otherwise steal round-robin from all others.
    #[default]
    WorkStealing,
    /// Workers only steal within their scheduler's range and fall back to the other schedulers
    /// when the whole range is empty.
    Placed,
}

/// The available verbosity levels of logging output
#[repr(usize)]
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    /// Log only very serious errors.
    Error = 1,
    /// Log only on hazardous situations.
    Warn,
    /// Log general information. This is the default.
    #[default]
    Info,
    /// Log lower priority, debug information.
    Debug,
    /// Log everything, often extremely verbose, very low priority information.
    Trace,
}

// === impl RuntimeConfig ===

impl RuntimeConfig {
    /// Parses and validates a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed, contains unknown keys, or describes an
    /// invalid runtime.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = toml::from_str(s).context("failed to parse runtime configuration")?;
        Self::from_raw(raw)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or [`Self::from_toml_str`] fails.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("invalid configuration {}", path.display()))
    }

    /// Returns a configuration with `workers` workers and defaults for everything else.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            workpiles: workers,
            ..Self::default()
        }
    }

    /// Checks the invariants the runtime relies on.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.workers >= 1, "at least one worker is required");
        ensure!(
            self.workpiles == self.workers,
            "every worker must own exactly one workpile (workers = {}, workpiles = {})",
            self.workers,
            self.workpiles
        );
        ensure!(
            (1..=self.workers).contains(&self.schedulers),
            "scheduler count must be between 1 and the worker count ({}), got {}",
            self.workers,
            self.schedulers
        );
        ensure!(
            self.deque_capacity >= 2,
            "deque capacity must be at least 2, got {}",
            self.deque_capacity
        );
        ensure!(
            u32::try_from(self.guid_capacity).is_ok() && self.guid_capacity > 0,
            "guid capacity must be between 1 and {}, got {}",
            u32::MAX,
            self.guid_capacity
        );
        ensure!(self.heap.size > 0, "heap size must be non-zero");
        Ok(())
    }

    fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
        let config = Self {
            workers: raw.workers,
            workpiles: raw.workpiles.unwrap_or(raw.workers),
            schedulers: raw.schedulers,
            scheduler: raw.scheduler,
            deque_capacity: raw.deque_capacity,
            guid_capacity: raw.guid_capacity,
            heap: raw.heap,
            idle: raw.idle,
            log_level: raw.log_level,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            workers,
            workpiles: workers,
            schedulers: default_schedulers(),
            scheduler: SchedulerKind::default(),
            deque_capacity: default_deque_capacity(),
            guid_capacity: default_guid_capacity(),
            heap: HeapConfig::default(),
            idle: IdleConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl FromStr for RuntimeConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            size: default_heap_size(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            spin_rounds: default_spin_rounds(),
            park_timeout_ms: default_park_timeout_ms(),
        }
    }
}

impl IdleConfig {
    pub fn park_timeout(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms)
    }
}

// === impl LogLevel ===

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::WorkStealing => f.write_str("work-stealing"),
            SchedulerKind::Placed => f.write_str("placed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.workpiles, config.workers);
        assert_eq!(config.deque_capacity, 32768);
        assert_eq!(config.log_level, LogLevel::Info);
        config.validate().unwrap();
    }

    #[test]
    fn parses_all_fields() {
        let config: RuntimeConfig = r#"
            workers = 4
            schedulers = 2
            scheduler = "placed"
            deque-capacity = 64
            guid-capacity = 1024
            log-level = "trace"

            [heap]
            size = 4096

            [idle]
            spin-rounds = 2
            park-timeout-ms = 1
        "#
        .parse()
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.workpiles, 4);
        assert_eq!(config.schedulers, 2);
        assert_eq!(config.scheduler, SchedulerKind::Placed);
        assert_eq!(config.deque_capacity, 64);
        assert_eq!(config.guid_capacity, 1024);
        assert_eq!(config.heap.size, 4096);
        assert_eq!(config.idle.spin_rounds, 2);
        assert_eq!(config.idle.park_timeout(), Duration::from_millis(1));
        assert_eq!(config.log_level.as_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(RuntimeConfig::from_toml_str("wrokers = 4").is_err());
        assert!(RuntimeConfig::from_toml_str("[heap]\nsize = 1\nalign = 8").is_err());
    }

    #[test]
    fn rejects_invalid_topologies() {
        assert!(RuntimeConfig::from_toml_str("workers = 0").is_err());
        assert!(RuntimeConfig::from_toml_str("workers = 2\nworkpiles = 1").is_err());
        assert!(RuntimeConfig::from_toml_str("workers = 2\nschedulers = 3").is_err());
        assert!(RuntimeConfig::from_toml_str("deque-capacity = 1").is_err());
        assert!(RuntimeConfig::from_toml_str("[heap]\nsize = 0").is_err());
    }

    #[test]
    fn with_workers() {
        let config = RuntimeConfig::with_workers(3);
        assert_eq!(config.workers, 3);
        assert_eq!(config.workpiles, 3);
        config.validate().unwrap();
    }
}
