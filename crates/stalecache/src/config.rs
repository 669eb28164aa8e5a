//! Cache configuration

use std::{path::Path, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    storage::{CacheLocation, CacheStore, FileCacheStore},
    strategy::CachingStrategy,
};

/// Cache configuration
///
/// ```toml
/// directory = "/var/cache/movies"   # optional, platform cache dir otherwise
/// app_name = "movies"
/// ttl_secs = 86400                  # optional, entries never expire otherwise
/// strategy = "stale-while-revalidate"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Explicit cache directory
    pub directory: Option<PathBuf>,
    /// Subdirectory of the platform cache directory when `directory` is unset
    pub app_name: String,
    /// Entry lifetime in seconds
    pub ttl_secs: Option<u64>,
    /// Default strategy for loaders built from this config
    pub strategy: CachingStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            app_name: "stalecache".to_string(),
            ttl_secs: None,
            strategy: CachingStrategy::default(),
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn location(&self) -> CacheLocation {
        match &self.directory {
            Some(directory) => CacheLocation::Directory(directory.clone()),
            None => CacheLocation::Platform {
                app_name: self.app_name.clone(),
            },
        }
    }

    /// Build a file store for this configuration
    pub fn build_store(&self) -> Arc<dyn CacheStore> {
        Arc::new(FileCacheStore::new(self.location()).with_ttl(self.ttl()))
    }
}
