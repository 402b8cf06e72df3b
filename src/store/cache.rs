//! Cache sections with adaptive freshness timeouts.
//!
//! Each logical data domain of the store has one [`CacheSection`]. A section
//! is valid while `now - timestamp < timeout`. The timeout adapts to usage:
//! once a section has seen `min_observations` lookups, the base timeout is
//! scaled by `0.5 + 1.5 * hit_ratio`, i.e. between 0.5x (every lookup missed)
//! and 2x (every lookup hit).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Logical data domains of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Configurations,
    Jobs,
    Statistics,
    Groups,
    MergeLogs,
    Draft,
    Notifications,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::Configurations,
        Section::Jobs,
        Section::Statistics,
        Section::Groups,
        Section::MergeLogs,
        Section::Draft,
        Section::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Configurations => "configurations",
            Section::Jobs => "jobs",
            Section::Statistics => "statistics",
            Section::Groups => "groups",
            Section::MergeLogs => "merge_logs",
            Section::Draft => "draft",
            Section::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MIN_SCALE: f64 = 0.5;
pub const MAX_SCALE: f64 = 2.0;

/// Freshness bookkeeping for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSection {
    pub name: Section,
    /// Last refresh, in epoch milliseconds.
    pub timestamp: Option<i64>,
    pub pending: bool,
    pub hit_count: u64,
    pub miss_count: u64,
}

impl CacheSection {
    pub fn new(name: Section) -> Self {
        Self {
            name,
            timestamp: None,
            pending: false,
            hit_count: 0,
            miss_count: 0,
        }
    }

    pub fn observations(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    /// Observed hit ratio, once enough lookups have been recorded.
    pub fn hit_ratio(&self, min_observations: u64) -> Option<f64> {
        let total = self.observations();
        if total == 0 || total < min_observations {
            return None;
        }
        Some(self.hit_count as f64 / total as f64)
    }

    /// Timeout after applying the hit-ratio scale to `base_ms`.
    pub fn effective_timeout_ms(&self, base_ms: u64, min_observations: u64) -> i64 {
        let scale = self
            .hit_ratio(min_observations)
            .map(|ratio| (MIN_SCALE + (MAX_SCALE - MIN_SCALE) * ratio).clamp(MIN_SCALE, MAX_SCALE))
            .unwrap_or(1.0);
        (base_ms as f64 * scale).round() as i64
    }

    pub fn is_valid(&self, now_ms: i64, timeout_ms: i64) -> bool {
        match self.timestamp {
            Some(ts) => now_ms - ts < timeout_ms,
            None => false,
        }
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.timestamp = Some(now_ms);
        self.pending = false;
    }

    pub fn invalidate(&mut self) {
        self.timestamp = None;
        self.pending = false;
    }

    pub fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.hit_count += 1;
        } else {
            self.miss_count += 1;
        }
    }
}

/// Base timeouts and adaptation threshold for all sections.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub base_timeouts_ms: BTreeMap<Section, u64>,
    pub default_timeout_ms: u64,
    pub min_observations: u64,
}

impl CachePolicy {
    pub fn base_timeout_ms(&self, section: Section) -> u64 {
        self.base_timeouts_ms
            .get(&section)
            .copied()
            .unwrap_or(self.default_timeout_ms)
    }

    pub fn timeout_ms(&self, section: &CacheSection) -> i64 {
        section.effective_timeout_ms(self.base_timeout_ms(section.name), self.min_observations)
    }

    pub fn timeout(&self, section: &CacheSection) -> Duration {
        Duration::from_millis(self.timeout_ms(section).max(0) as u64)
    }

    pub fn is_valid(&self, section: &CacheSection, now_ms: i64) -> bool {
        section.is_valid(now_ms, self.timeout_ms(section))
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            base_timeouts_ms: BTreeMap::new(),
            default_timeout_ms: 60_000,
            min_observations: 10,
        }
    }
}
