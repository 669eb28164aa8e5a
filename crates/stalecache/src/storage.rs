//! Cache storage backends
//!
//! A store maps a key to a single timestamped payload. The timestamp lives
//! inside the entry itself, so every file on disk is self-describing and there
//! is no side index to drift out of sync after a crash.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    error::{StoreError, StoreResult},
};

/// A stored payload and the instant it was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
    /// The cached bytes
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_timestamp(payload, Utc::now())
    }

    /// Create an entry with an explicit timestamp
    pub fn with_timestamp(payload: Vec<u8>, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, payload }
    }

    /// Absolute time between the write and `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now.signed_duration_since(self.timestamp);
        let elapsed = if elapsed < chrono::Duration::zero() {
            -elapsed
        } else {
            elapsed
        };
        elapsed.to_std().unwrap_or(Duration::MAX)
    }

    /// Whether the entry is past `ttl` at `now`; without a TTL nothing expires
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        ttl.map_or(false, |ttl| self.age(now) >= ttl)
    }

    /// Serialize to the on-disk JSON form
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse the on-disk JSON form
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Cache storage trait
///
/// Keys must already be filesystem-safe; stores do no sanitization.
/// Operations are synchronous and expected to be fast.
pub trait CacheStore: Send + Sync {
    /// Store `payload` under `key`, replacing any previous entry
    fn store(&self, key: &str, payload: &[u8]) -> StoreResult<()>;

    /// Load the payload under `key`
    ///
    /// Returns `None` when there is no entry or when it is expired. Expired
    /// entries are left in place until the next `store` overwrites them.
    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
}

/// Where a [`FileCacheStore`] keeps its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// `<platform cache dir>/<app_name>`
    Platform { app_name: String },
    /// An explicit directory
    Directory(PathBuf),
}

impl CacheLocation {
    /// Resolve the directory without touching the filesystem
    pub fn resolve(&self) -> StoreResult<PathBuf> {
        match self {
            CacheLocation::Directory(path) => Ok(path.clone()),
            CacheLocation::Platform { app_name } => dirs::cache_dir()
                .map(|base| base.join(app_name))
                .ok_or_else(|| StoreError::DirectoryUnavailable {
                    message: "could not determine platform cache directory".to_string(),
                }),
        }
    }
}

/// Disk-based cache storage, one file per key
pub struct FileCacheStore {
    location: CacheLocation,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl FileCacheStore {
    /// Create a store in `location` with no TTL
    pub fn new(location: CacheLocation) -> Self {
        Self {
            location,
            ttl: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a store rooted at an explicit directory
    pub fn in_dir<P: AsRef<Path>>(path: P) -> Self {
        Self::new(CacheLocation::Directory(path.as_ref().to_path_buf()))
    }

    /// Expire entries older than `ttl` on read
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Use a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn location(&self) -> &CacheLocation {
        &self.location
    }

    /// File path backing `key`
    pub fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        Ok(self.location.resolve()?.join(key))
    }

    fn ensure_dir(&self) -> StoreResult<PathBuf> {
        let dir = self.location.resolve()?;
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| StoreError::DirectoryUnavailable {
                message: format!("failed to create {}: {}", dir.display(), e),
            })?;
            debug!("Created cache directory: {}", dir.display());
        }
        Ok(dir)
    }
}

impl CacheStore for FileCacheStore {
    fn store(&self, key: &str, payload: &[u8]) -> StoreResult<()> {
        let path = self.ensure_dir()?.join(key);
        let entry = CacheEntry::with_timestamp(payload.to_vec(), self.clock.now());

        entry
            .encode()
            .map_err(io::Error::from)
            .and_then(|encoded| write_atomic(&path, &encoded))
            .map_err(|source| StoreError::WriteFailed {
                key: key.to_string(),
                source,
            })?;

        debug!(key, bytes = payload.len(), "Stored cache entry");
        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key, "Cache miss");
                return Ok(None);
            }
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    key: key.to_string(),
                    source,
                })
            }
        };

        let entry = CacheEntry::decode(&bytes).map_err(|e| StoreError::DecodeFailed {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        if entry.is_expired(self.ttl, self.clock.now()) {
            debug!(key, "Cache entry expired");
            return Ok(None);
        }

        debug!(key, "Cache hit");
        Ok(Some(entry.payload))
    }
}

/// Write through a uniquely named sibling temp file, then rename over `path`
///
/// Concurrent writers to the same key never share a temp file, so whichever
/// rename lands last installs a complete entry.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = temp_path(path);
    fs::write(&temp_path, contents)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = format!(
        ".tmp-{}-{}",
        Uuid::new_v4(),
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry")
    );
    path.with_file_name(file_name)
}

/// In-memory cache storage
///
/// Same entry and expiry semantics as [`FileCacheStore`], without disk I/O.
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Raw entry under `key`, ignoring expiry
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryCacheStore {
    fn store(&self, key: &str, payload: &[u8]) -> StoreResult<()> {
        let entry = CacheEntry::with_timestamp(payload.to_vec(), self.clock.now());
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(self.ttl, self.clock.now()))
            .map(|entry| entry.payload.clone()))
    }
}
