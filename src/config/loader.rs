//! Configuration loader with tier-based merging.

use super::merge::deep_merge_all;
use super::types::EngineConfig;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "config.yaml";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults = 0,
    /// `$CWD/dedupe/`
    Project = 1,
    /// `~/.dedupe/`
    User = 2,
    /// `DEDUPE_*` variables
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover directories from the environment, falling back to
    /// `./dedupe` and `~/.dedupe`.
    pub fn discover() -> Self {
        let project_dir = std::env::var("DEDUPE_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("dedupe")));

        let user_dir = std::env::var("DEDUPE_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".dedupe")));

        Self {
            project_dir,
            user_dir,
        }
    }

    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }

    fn tier_file(&self, tier: ConfigTier) -> Option<PathBuf> {
        let dir = match tier {
            ConfigTier::Project => self.project_dir.as_ref(),
            ConfigTier::User => self.user_dir.as_ref(),
            ConfigTier::Defaults | ConfigTier::Environment => None,
        }?;
        Some(dir.join(CONFIG_FILE))
    }
}

/// Loads [`EngineConfig`] from defaults, project, user and environment tiers.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: EngineConfig,
    /// Files that contributed to the merged configuration, lowest tier first.
    sources: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load with explicit tier directories. `DEDUPE_CONFIG_PATH`, when set,
    /// replaces the file tiers entirely.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        if let Ok(explicit) = std::env::var("DEDUPE_CONFIG_PATH") {
            return Self::load_file(paths, PathBuf::from(explicit));
        }

        let mut tiers: Vec<Value> = vec![serde_json::to_value(EngineConfig::default())?];
        let mut sources = Vec::new();

        for tier in [ConfigTier::Project, ConfigTier::User] {
            let Some(file) = paths.tier_file(tier) else {
                continue;
            };
            if let Some(value) = read_tier(&file, tier) {
                tiers.push(value);
                sources.push(file);
            }
        }

        let merged = deep_merge_all(tiers);
        let mut config: EngineConfig =
            serde_json::from_value(merged).context("Invalid merged configuration")?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;

        Ok(Self {
            paths,
            config,
            sources,
        })
    }

    /// Load a single explicit file on top of defaults.
    pub fn load_file(paths: ConfigPaths, path: PathBuf) -> Result<Self> {
        let mut config = EngineConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(Self {
            paths,
            config,
            sources: vec![path],
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn into_config(self) -> EngineConfig {
        self.config
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn project_dir(&self) -> Option<&Path> {
        self.paths.project_dir.as_deref()
    }

    pub fn user_dir(&self) -> Option<&Path> {
        self.paths.user_dir.as_deref()
    }
}

/// Read one tier. Missing files are skipped silently; unreadable or invalid
/// files are skipped with a warning.
fn read_tier(file: &Path, tier: ConfigTier) -> Option<Value> {
    if !file.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            warn!("Skipping {} config {}: {}", tier, file.display(), e);
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Null) => None,
        Ok(value) => {
            debug!("Loaded {} config from {}", tier, file.display());
            Some(value)
        }
        Err(e) => {
            warn!("Skipping {} config {}: {}", tier, file.display(), e);
            None
        }
    }
}

/// Apply `DEDUPE_*` overrides. Unparseable numbers are ignored with a warning.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db_path) = lookup("DEDUPE_DB_PATH") {
        config.paths.db_path = PathBuf::from(db_path);
    }
    if let Some(path) = lookup("DEDUPE_CONFIGURATIONS_PATH") {
        config.paths.configurations_path = PathBuf::from(path);
    }
    if let Some(raw) = lookup("DEDUPE_THROTTLE_MS") {
        match raw.parse() {
            Ok(ms) => config.store.throttle_window_ms = ms,
            Err(_) => warn!("Ignoring DEDUPE_THROTTLE_MS={}: not a number", raw),
        }
    }
    if let Some(raw) = lookup("DEDUPE_POLL_INTERVAL_MS") {
        match raw.parse() {
            Ok(ms) => config.jobs.poll_interval_ms = ms,
            Err(_) => warn!("Ignoring DEDUPE_POLL_INTERVAL_MS={}: not a number", raw),
        }
    }
}
