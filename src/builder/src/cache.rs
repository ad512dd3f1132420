//! Layer cache: maps a step's fingerprint to the image it produced.
//!
//! Entries are append-only. A key is derived from the parent image, the
//! opcode, the expanded arguments and (for ADD/COPY) the content
//! fingerprint of every source, so any change upstream yields a new key.
//! The table can optionally be persisted as a JSON index so it survives
//! process restarts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strata_core::config::BuilderConfig;
use strata_core::error::{BuildError, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::digest::sha256_fields;
use crate::dockerfile::Opcode;
use crate::state::{ImageConfig, ImageId};

/// Fingerprint of one build step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a step.
    ///
    /// `fingerprint` is empty for instructions that read no files.
    pub fn compute(parent: &ImageId, opcode: Opcode, args: &str, fingerprint: &str) -> Self {
        Self(sha256_fields([
            parent.as_str(),
            opcode.as_str(),
            args,
            fingerprint,
        ]))
    }

    /// Key of the closing commit that bakes the final config onto `parent`.
    pub fn for_config(parent: &ImageId, config: &ImageConfig) -> Result<Self> {
        let config = serde_json::to_string(config)?;
        Ok(Self(sha256_fields([parent.as_str(), "CONFIG", &config, ""])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A recorded step result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub image: ImageId,
    pub created_at: DateTime<Utc>,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
}

/// Concurrent cache entry table shared by every build of a process.
pub struct BuildCache {
    /// In-memory index: key → entry
    entries: DashMap<String, CacheEntry>,
    /// Per-key critical sections around lookup, execute and store
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// JSON index location, if persisted
    index_path: Option<PathBuf>,
    /// Serialises index rewrites
    persist_lock: parking_lot::Mutex<()>,
}

/// Held critical section for one cache key.
pub struct KeyGuard<'a> {
    cache: &'a BuildCache,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so our own handle no longer counts
        drop(self.guard.take());
        self.cache
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl Default for BuildCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl BuildCache {
    /// A cache that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            index_path: None,
            persist_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Open a cache persisted at `index_path`, loading existing entries.
    pub fn open(index_path: &Path) -> Result<Self> {
        let mut cache = Self::in_memory();
        cache.index_path = Some(index_path.to_path_buf());

        if index_path.exists() {
            let data = std::fs::read_to_string(index_path).map_err(|e| {
                BuildError::CacheStore(format!(
                    "Failed to read cache index {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            let index: CacheIndex = serde_json::from_str(&data).map_err(|e| {
                BuildError::CacheStore(format!(
                    "Failed to parse cache index {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            for (key, entry) in index.entries {
                cache.entries.insert(key, entry);
            }
            tracing::debug!(
                path = %index_path.display(),
                entries = cache.entries.len(),
                "Loaded cache index"
            );
        }

        Ok(cache)
    }

    /// Cache described by the builder configuration.
    pub fn from_config(config: &BuilderConfig) -> Result<Self> {
        match config.cache_index {
            Some(ref path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Enter the critical section for `key`.
    ///
    /// Holders of the same key are serialised; the guard must be held from
    /// lookup until the step's result has been stored. The key's mutex is
    /// dropped from the table when the last holder or waiter lets go.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let mutex = self
            .locks
            .entry(key.0.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .value()
            .clone();
        KeyGuard {
            cache: self,
            key: key.0.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Number of keys with a live critical section.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<ImageId> {
        self.entries.get(&key.0).map(|entry| entry.image.clone())
    }

    /// Record a step result. The first committer wins: an existing entry
    /// is never replaced.
    ///
    /// Returns whether the entry was inserted. The in-memory table is
    /// always updated; a failure to rewrite the persisted index is
    /// reported as [`BuildError::CacheStore`].
    pub fn store(&self, key: &CacheKey, image: &ImageId) -> Result<bool> {
        let inserted = match self.entries.entry(key.0.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    image: image.clone(),
                    created_at: Utc::now(),
                });
                true
            }
        };

        if inserted {
            tracing::debug!(key = %key, image = %image, "Stored cache entry");
            self.persist()?;
        }
        Ok(inserted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_path(&self) -> Option<&Path> {
        self.index_path.as_deref()
    }

    /// Rewrite the JSON index atomically (temp file + rename).
    fn persist(&self) -> Result<()> {
        let Some(ref index_path) = self.index_path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock();

        let index = CacheIndex {
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let data = serde_json::to_string_pretty(&index)?;

        if let Some(parent) = index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BuildError::CacheStore(format!(
                        "Failed to create cache directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let tmp_path = index_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, data).map_err(|e| {
            BuildError::CacheStore(format!(
                "Failed to write cache index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, index_path).map_err(|e| {
            BuildError::CacheStore(format!(
                "Failed to replace cache index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        Ok(())
    }
}
