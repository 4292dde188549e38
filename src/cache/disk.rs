//! Concurrency-safe cache store holding payload entries in memory and file
//! entries under a dedicated cache directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{CacheError, CacheStore};

/// A cache entry: payload or owned file, tagged with creation time and TTL.
#[derive(Debug, Clone)]
enum StoredEntry {
    Payload {
        bytes: Vec<u8>,
        stored_at: SystemTime,
        ttl: Duration,
    },
    File {
        path: PathBuf,
        stored_at: SystemTime,
        ttl: Duration,
    },
}

impl StoredEntry {
    /// An entry is valid while `now - stored_at <= ttl`. A clock that went
    /// backwards reads as stale.
    fn is_fresh(&self) -> bool {
        let (stored_at, ttl) = match self {
            Self::Payload { stored_at, ttl, .. } | Self::File { stored_at, ttl, .. } => {
                (*stored_at, *ttl)
            }
        };
        match stored_at.elapsed() {
            Ok(elapsed) => elapsed <= ttl,
            Err(_) => false,
        }
    }

    fn owned_file(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Payload { .. } => None,
        }
    }
}

/// Cache store backed by a `DashMap` index and a dedicated directory for
/// file entries.
///
/// Cached files are named by opaque generated identifiers, never derived
/// from the request URL. File placement is write-temp-then-rename, so a
/// concurrent reader never observes a half-written artifact. Per-key
/// exclusion comes from the map's entry locking; unrelated keys never
/// contend on a global lock.
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    entries: DashMap<String, StoredEntry>,
}

impl DiskCache {
    /// Opens a cache rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory cannot be created.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        Ok(Self {
            dir,
            entries: DashMap::new(),
        })
    }

    /// Removes stale entries and their files, returning how many were
    /// reclaimed. Lazy expiry at lookup already guarantees correctness;
    /// this only reclaims disk space early.
    pub async fn sweep(&self) -> usize {
        let mut stale_files = Vec::new();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_fresh() {
                true
            } else {
                if let Some(path) = entry.owned_file() {
                    stale_files.push(path.to_path_buf());
                }
                removed += 1;
                false
            }
        });
        for path in stale_files {
            remove_file_quietly(&path).await;
        }
        removed
    }

    /// Number of indexed entries, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn opaque_name() -> String {
        format!("{:032x}", rand::random::<u128>())
    }

    /// Removes the entry under `key`, deleting an owned file.
    async fn evict(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            if let Some(path) = entry.owned_file() {
                remove_file_quietly(path).await;
            }
        }
    }

    /// Inserts an entry, releasing the file owned by whatever it replaced.
    async fn replace(&self, key: &str, entry: StoredEntry) {
        let previous = self.entries.insert(key.to_string(), entry);
        if let Some(path) = previous.as_ref().and_then(StoredEntry::owned_file) {
            remove_file_quietly(path).await;
        }
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    async fn store_payload(&self, key: &str, payload: Vec<u8>, ttl: Duration) {
        debug!(key, bytes = payload.len(), ttl_secs = ttl.as_secs(), "caching payload");
        self.replace(
            key,
            StoredEntry::Payload {
                bytes: payload,
                stored_at: SystemTime::now(),
                ttl,
            },
        )
        .await;
    }

    async fn store_file(
        &self,
        key: &str,
        source: &Path,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        // Copy into a temp name first; the rename makes the final name
        // appear fully written or not at all.
        let final_path = self.dir.join(Self::opaque_name());
        let temp_path = self.dir.join(format!(".{}.tmp", Self::opaque_name()));

        if let Err(e) = tokio::fs::copy(source, &temp_path).await {
            return Err(CacheError::io(&temp_path, e));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            remove_file_quietly(&temp_path).await;
            return Err(CacheError::io(&final_path, e));
        }

        debug!(key, path = %final_path.display(), ttl_secs = ttl.as_secs(), "caching file");
        self.replace(
            key,
            StoredEntry::File {
                path: final_path,
                stored_at: SystemTime::now(),
                ttl,
            },
        )
        .await;
        Ok(())
    }

    async fn lookup_payload(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?.clone();
        if !entry.is_fresh() {
            debug!(key, "evicting stale entry");
            self.evict(key).await;
            return None;
        }
        match entry {
            StoredEntry::Payload { bytes, .. } => Some(bytes),
            StoredEntry::File { .. } => None,
        }
    }

    async fn lookup_file(&self, key: &str) -> Option<PathBuf> {
        let entry = self.entries.get(key)?.clone();
        if !entry.is_fresh() {
            debug!(key, "evicting stale entry");
            self.evict(key).await;
            return None;
        }
        match entry {
            StoredEntry::File { path, .. } => Some(path),
            StoredEntry::Payload { .. } => None,
        }
    }

    async fn evict_all(&self) {
        let mut files = Vec::new();
        for entry in self.entries.iter() {
            if let Some(path) = entry.value().owned_file() {
                files.push(path.to_path_buf());
            }
        }
        self.entries.clear();
        for path in files {
            remove_file_quietly(&path).await;
        }
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}
