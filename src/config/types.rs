//! Configuration types for the engine.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::store::{CachePolicy, Section};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

impl EngineConfig {
    /// Load configuration from a single YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Empty or comment-only YAML parses as null.
        let config: Option<EngineConfig> = serde_yaml::from_str(&content)?;
        let config = config.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.max_batch_size == 0 {
            return Err(anyhow!("jobs.max_batch_size must be at least 1"));
        }
        if self.jobs.default_batch_size == 0
            || self.jobs.default_batch_size > self.jobs.max_batch_size
        {
            return Err(anyhow!(
                "jobs.default_batch_size must be between 1 and {}",
                self.jobs.max_batch_size
            ));
        }
        if self.store.error_capacity == 0 {
            return Err(anyhow!("store.error_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// State store tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Trailing-edge broadcast window in milliseconds (default: 500).
    #[serde(default = "default_throttle_window_ms")]
    pub throttle_window_ms: u64,

    /// Errors retained in the store (default: 10).
    #[serde(default = "default_capacity")]
    pub error_capacity: usize,

    /// Informational notices retained in the store (default: 10).
    #[serde(default = "default_capacity")]
    pub notice_capacity: usize,

    /// Lookups required before cache timeouts adapt (default: 10).
    #[serde(default = "default_min_observations")]
    pub min_observations: u64,

    /// Base cache timeout used for sections without an override (default: 60000).
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Per-section base cache timeouts in milliseconds.
    #[serde(default = "default_cache_timeouts")]
    pub cache_timeouts_ms: BTreeMap<Section, u64>,

    /// Session bus channel capacity (default: 100).
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            throttle_window_ms: default_throttle_window_ms(),
            error_capacity: default_capacity(),
            notice_capacity: default_capacity(),
            min_observations: default_min_observations(),
            default_timeout_ms: default_timeout_ms(),
            cache_timeouts_ms: default_cache_timeouts(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl StoreConfig {
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            base_timeouts_ms: self.cache_timeouts_ms.clone(),
            default_timeout_ms: self.default_timeout_ms,
            min_observations: self.min_observations,
        }
    }
}

fn default_throttle_window_ms() -> u64 {
    500
}

fn default_capacity() -> usize {
    10
}

fn default_min_observations() -> u64 {
    10
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_bus_capacity() -> usize {
    100
}

fn default_cache_timeouts() -> BTreeMap<Section, u64> {
    BTreeMap::from([
        (Section::Configurations, 300_000), // 5 minutes
        (Section::Jobs, 30_000),
        (Section::Statistics, 120_000),
        (Section::MergeLogs, 60_000),
    ])
}

/// Job submission and observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Interval between job status polls in milliseconds (default: 5000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Largest accepted batch size (default: 2000).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// Batch size used when a configuration does not set one (default: 200).
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_batch_size: default_max_batch_size(),
            default_batch_size: default_batch_size(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_batch_size() -> u32 {
    2_000
}

fn default_batch_size() -> u32 {
    200
}

/// File locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// SQLite database holding the audit log, drafts and job history.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// YAML document listing matching configurations.
    #[serde(default = "default_configurations_path")]
    pub configurations_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            configurations_path: default_configurations_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".dedupe/dedupe.db")
}

fn default_configurations_path() -> PathBuf {
    PathBuf::from("dedupe/configurations.yaml")
}
