//! Sync configuration, stored as a JSON file

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};
use crate::query::Query;

/// Marker attribute set on local objects that still need to be pushed
pub const INTERNAL_SYNC: &str = "internal.sync";

/// Name of the push query registered by `sync_all_changes`
pub const SYNC_ALL_MODIFIED_OBJECTS: &str = "syncAllModifiedObjects";

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

/// Which objects to pull and push, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncingConfig {
    /// Name → query evaluated against the remote
    #[serde(default)]
    pub pull_queries: BTreeMap<String, Query>,
    /// Name → query evaluated against the local repository
    #[serde(default)]
    pub push_queries: BTreeMap<String, Query>,
    /// Mark every local mutation for upload
    #[serde(default)]
    pub sync_all_changes: bool,
    /// Replace local copies when the remote one is strictly newer
    #[serde(default = "default_true")]
    pub pulls_overwrite_if_newer: bool,
    /// Seconds between periodic passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncingConfig {
    fn default() -> Self {
        Self {
            pull_queries: BTreeMap::new(),
            push_queries: BTreeMap::new(),
            sync_all_changes: false,
            pulls_overwrite_if_newer: true,
            interval_secs: default_interval_secs(),
        }
    }
}

impl SyncingConfig {
    pub fn add_pull_query(&mut self, name: impl Into<String>, query: Query) {
        self.pull_queries.insert(name.into(), query);
    }

    pub fn add_push_query(&mut self, name: impl Into<String>, query: Query) {
        self.push_queries.insert(name.into(), query);
    }

    /// Toggle `sync_all_changes` together with its marker push query
    pub fn set_sync_all_changes(&mut self, enabled: bool) {
        self.sync_all_changes = enabled;
        if enabled {
            self.push_queries.insert(
                SYNC_ALL_MODIFIED_OBJECTS.to_string(),
                Query::attribute(INTERNAL_SYNC, "true"),
            );
        } else {
            self.push_queries.remove(SYNC_ALL_MODIFIED_OBJECTS);
        }
    }

    /// Load from `path`; a missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        let mut config: SyncingConfig = serde_json::from_str(&data)
            .map_err(|e| RepositoryError::Serialization(format!("sync config {:?}: {}", path, e)))?;
        if config.sync_all_changes {
            config.set_sync_all_changes(true);
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
