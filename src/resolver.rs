//! Configuration resolver.
//!
//! Reads matching configurations from a declarative source, keeps the active
//! ones and checks that every match field is readable. The resolved list is
//! held in an [`ArcSwap`] so readers never block a reload.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::types::{MasterStrategy, MatchConfiguration};

/// Configuration record in its external shape. `matchFields` and
/// `requiredFields` are comma-separated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub label: String,
    pub developer_name: String,
    pub object_type: String,
    pub match_fields: String,
    #[serde(default)]
    pub required_fields: Option<String>,
    #[serde(default)]
    pub field_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub master_strategy: Option<String>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Split a comma-separated field list, trimming and dropping duplicates while
/// keeping first-seen order.
pub fn parse_field_list(raw: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .filter(|f| seen.insert(f.to_string()))
        .map(String::from)
        .collect()
}

impl ConfigurationRecord {
    /// Convert to a [`MatchConfiguration`], applying the default batch size.
    pub fn into_configuration(self, default_batch_size: u32) -> EngineResult<MatchConfiguration> {
        let match_fields = parse_field_list(&self.match_fields);
        if match_fields.is_empty() {
            return Err(EngineError::configuration(format!(
                "Configuration {} has no match fields",
                self.developer_name
            )));
        }
        let master_strategy = match self.master_strategy.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => MasterStrategy::default(),
        };
        Ok(MatchConfiguration {
            id: self.id.unwrap_or_else(|| self.developer_name.clone()),
            label: self.label,
            developer_name: self.developer_name,
            object_type: self.object_type,
            match_fields,
            required_fields: self
                .required_fields
                .as_deref()
                .map(parse_field_list)
                .unwrap_or_default(),
            field_labels: self.field_labels,
            master_strategy,
            batch_size: self.batch_size.unwrap_or(default_batch_size),
            active: self.active,
        })
    }
}

/// Source of configuration records.
pub trait ConfigurationSource: Send + Sync {
    fn load(&self) -> EngineResult<Vec<ConfigurationRecord>>;
}

#[derive(Debug, Deserialize)]
struct ConfigurationDocument {
    #[serde(default)]
    configurations: Vec<ConfigurationRecord>,
}

/// Reads a YAML document with a top-level `configurations:` list.
#[derive(Debug, Clone)]
pub struct YamlConfigurationSource {
    path: PathBuf,
}

impl YamlConfigurationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigurationSource for YamlConfigurationSource {
    fn load(&self) -> EngineResult<Vec<ConfigurationRecord>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            EngineError::configuration(format!(
                "Matching configurations unavailable at {}",
                self.path.display()
            ))
            .with_details(e.to_string())
        })?;
        let document: Option<ConfigurationDocument> =
            serde_yaml::from_str(&content).map_err(|e| {
                EngineError::configuration("Matching configurations could not be parsed")
                    .with_details(e.to_string())
            })?;
        Ok(document.map(|d| d.configurations).unwrap_or_default())
    }
}

/// Fixed in-memory records.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigurationSource {
    records: Vec<ConfigurationRecord>,
}

impl StaticConfigurationSource {
    pub fn new(records: Vec<ConfigurationRecord>) -> Self {
        Self { records }
    }
}

impl ConfigurationSource for StaticConfigurationSource {
    fn load(&self) -> EngineResult<Vec<ConfigurationRecord>> {
        Ok(self.records.clone())
    }
}

/// Field-level read permission check.
pub trait FieldPermissions: Send + Sync {
    fn can_read(&self, object_type: &str, field: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl FieldPermissions for AllowAll {
    fn can_read(&self, _object_type: &str, _field: &str) -> bool {
        true
    }
}

/// Denies specific `(object type, field)` pairs.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    denied: BTreeSet<(String, String)>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, object_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.denied.insert((object_type.into(), field.into()));
        self
    }
}

impl FieldPermissions for DenyList {
    fn can_read(&self, object_type: &str, field: &str) -> bool {
        !self
            .denied
            .contains(&(object_type.to_string(), field.to_string()))
    }
}

/// Resolves and caches the active matching configurations.
pub struct ConfigurationResolver {
    source: Box<dyn ConfigurationSource>,
    permissions: Box<dyn FieldPermissions>,
    default_batch_size: u32,
    resolved: ArcSwap<Vec<MatchConfiguration>>,
}

impl ConfigurationResolver {
    pub fn new(source: impl ConfigurationSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            permissions: Box::new(AllowAll),
            default_batch_size: 200,
            resolved: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn with_permissions(mut self, permissions: impl FieldPermissions + 'static) -> Self {
        self.permissions = Box::new(permissions);
        self
    }

    pub fn with_default_batch_size(mut self, batch_size: u32) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    /// Active configurations ordered by label, then developer name.
    ///
    /// Fails with a configuration error if the source is unavailable and with
    /// an access error if any match field of an active configuration is not
    /// readable.
    pub fn list_active_configurations(&self) -> EngineResult<Vec<MatchConfiguration>> {
        let records = self.source.load()?;
        let mut active = Vec::new();
        for record in records.into_iter().filter(|r| r.active) {
            let config = record.into_configuration(self.default_batch_size)?;
            let denied: Vec<String> = config
                .match_fields
                .iter()
                .filter(|f| !self.permissions.can_read(&config.object_type, f))
                .cloned()
                .collect();
            if !denied.is_empty() {
                return Err(EngineError::access(format!(
                    "No read access to {} fields: {}",
                    config.object_type,
                    denied.join(", ")
                ))
                .with_fields(denied));
            }
            active.push(config);
        }
        active.sort_by(|a, b| {
            a.label
                .cmp(&b.label)
                .then_with(|| a.developer_name.cmp(&b.developer_name))
        });

        info!("Resolved {} active matching configurations", active.len());
        self.resolved.store(Arc::new(active.clone()));
        Ok(active)
    }

    /// Last successfully resolved list, without touching the source.
    pub fn cached(&self) -> Arc<Vec<MatchConfiguration>> {
        self.resolved.load_full()
    }

    /// A single active configuration by id.
    pub fn find(&self, id: &str) -> EngineResult<MatchConfiguration> {
        if let Some(config) = self.resolved.load().iter().find(|c| c.id == id) {
            return Ok(config.clone());
        }
        debug!(config_id = %id, "Configuration not cached, reloading");
        self.list_active_configurations()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| {
                EngineError::configuration(format!("No active matching configuration {}", id))
            })
    }
}
