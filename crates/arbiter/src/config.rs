//! Quota configuration.
//!
//! Limits are looked up in two layers: a per-resource entry wins, otherwise
//! the per-class default applies to every resource, otherwise the class is
//! unlimited. A limit of 0 also means unlimited.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{OperationClass, ResourceKey};

/// Default concurrent reads per resource when no config file is given.
pub const DEFAULT_READ_LIMIT: u32 = 128;
/// Default concurrent writes per resource when no config file is given.
pub const DEFAULT_WRITE_LIMIT: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Mapping of resource identity to per-class concurrency ceilings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Per-class limits applied to any resource without its own entry for that class.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<OperationClass, u32>,

    /// Per-resource overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<ResourceKey, BTreeMap<OperationClass, u32>>,
}

impl QuotaConfig {
    /// The limits a server runs with when started without a config file.
    pub fn builtin() -> Self {
        Self::default()
            .with_default(OperationClass::read(), DEFAULT_READ_LIMIT)
            .with_default(OperationClass::write(), DEFAULT_WRITE_LIMIT)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded quota config");
        Ok(config)
    }

    pub fn with_default(mut self, class: OperationClass, limit: u32) -> Self {
        self.defaults.insert(class, limit);
        self
    }

    pub fn with_limit(mut self, resource: ResourceKey, class: OperationClass, limit: u32) -> Self {
        self.set_limit(resource, class, limit);
        self
    }

    pub fn set_limit(&mut self, resource: ResourceKey, class: OperationClass, limit: u32) {
        self.resources.entry(resource).or_default().insert(class, limit);
    }

    /// Effective ceiling for (resource, class); 0 means unlimited.
    pub fn limit_for(&self, resource: &ResourceKey, class: &OperationClass) -> u32 {
        self.resources
            .get(resource)
            .and_then(|classes| classes.get(class))
            .or_else(|| self.defaults.get(class))
            .copied()
            .unwrap_or(0)
    }
}
