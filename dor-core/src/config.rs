//! Backend configuration
//!
//! A small JSON document naming which backend to open:
//!
//! ```json
//! {"type": "filesystem", "root": "/var/lib/dor"}
//! {"type": "sqlite", "path": "/var/lib/dor/objects.sqlite"}
//! {"type": "rest", "base_uri": "http://repo:8080", "username": "sync"}
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};
use crate::filesystem::FilesystemRepository;
use crate::memory::MemoryRepository;
use crate::repository::SharedRepository;
use crate::rest::RestRepository;
use crate::sqlite_repository::SqliteRepository;

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    90
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory,
    Filesystem {
        root: PathBuf,
    },
    Sqlite {
        path: PathBuf,
        /// Defaults to `element-files` next to the database
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_dir: Option<PathBuf>,
    },
    Rest {
        base_uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
        #[serde(default = "default_read_timeout")]
        read_timeout_secs: u64,
    },
}

impl BackendConfig {
    /// Open the configured backend.
    ///
    /// The REST backend uses a blocking HTTP client, so call this outside of
    /// an async context (or from `spawn_blocking`).
    pub fn open(&self) -> Result<SharedRepository> {
        let repo: SharedRepository = match self {
            BackendConfig::Memory => Arc::new(MemoryRepository::new()),
            BackendConfig::Filesystem { root } => Arc::new(FilesystemRepository::open(root)?),
            BackendConfig::Sqlite { path, element_dir } => {
                let element_dir = match element_dir {
                    Some(dir) => dir.clone(),
                    None => path
                        .parent()
                        .unwrap_or_else(|| Path::new("."))
                        .join("element-files"),
                };
                Arc::new(SqliteRepository::open(path, &element_dir)?)
            }
            BackendConfig::Rest {
                base_uri,
                username,
                password,
                connect_timeout_secs,
                read_timeout_secs,
            } => {
                let credentials = username
                    .as_ref()
                    .map(|u| (u.clone(), password.clone().unwrap_or_default()));
                Arc::new(RestRepository::with_timeouts(
                    base_uri,
                    credentials,
                    Duration::from_secs(*connect_timeout_secs),
                    Duration::from_secs(*read_timeout_secs),
                )?)
            }
        };
        tracing::debug!("Opened {} backend", self.kind());
        Ok(repo)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Filesystem { .. } => "filesystem",
            BackendConfig::Sqlite { .. } => "sqlite",
            BackendConfig::Rest { .. } => "rest",
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| RepositoryError::Serialization(format!("backend config {:?}: {}", path, e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
