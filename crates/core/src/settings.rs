use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{default_config_dir, StorageError};

pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to resolve config directory: {0}")]
    Config(#[from] StorageError),
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Tunables read from `settings.toml`; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub query_timeout_secs: u64,
    /// Database opened when a profile has none configured. When unset the
    /// backend's administrative database is used.
    pub fallback_database: Option<String>,
    pub log_filter: String,
    pub storage_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            fallback_database: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            storage_dir: None,
        }
    }
}

impl Settings {
    pub fn load_default() -> Result<Self, SettingsError> {
        let path = default_config_dir()?.join("settings.toml");
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Zero falls back to the default.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        match self.query_timeout_secs {
            0 => Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    #[must_use]
    pub fn fallback_database(&self) -> Option<&str> {
        self.fallback_database
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
