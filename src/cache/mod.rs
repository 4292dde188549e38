//! Key-addressed cache store with TTL-tagged entries.
//!
//! Entries are addressed by the canonical request URL and hold either an
//! in-memory payload or a reference to an on-disk file owned exclusively
//! by the entry. Expiry is checked lazily at lookup time; a stale entry is
//! treated as absent and evicted on touch.

mod disk;

pub use disk::DiskCache;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by cache file operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Disk failure while copying or placing a cached file.
    #[error("cache IO error for {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Pluggable cache capability consumed by the orchestrator.
///
/// Implementations must serialize concurrent reads and writes to the same
/// key so that lookup-then-store sequences from concurrent callers cannot
/// interleave into a corrupted entry. No ordering is required across
/// unrelated keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stores an in-memory payload under the key, replacing any prior
    /// entry (and deleting a file the prior entry owned).
    async fn store_payload(&self, key: &str, payload: Vec<u8>, ttl: Duration);

    /// Copies the file at `source` into cache-owned storage under the key,
    /// replacing any prior entry. The destination is never observable in a
    /// half-written state.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on disk failure; the prior entry, if any,
    /// is left intact in that case.
    async fn store_file(&self, key: &str, source: &Path, ttl: Duration)
    -> Result<(), CacheError>;

    /// Returns the payload stored under the key, if present and within its
    /// TTL. A stale entry is evicted and reads as absent.
    async fn lookup_payload(&self, key: &str) -> Option<Vec<u8>>;

    /// Returns the path of the file stored under the key, if present and
    /// within its TTL. A stale entry is evicted (deleting its file) and
    /// reads as absent.
    async fn lookup_file(&self, key: &str) -> Option<PathBuf>;

    /// Removes every entry, deleting owned files.
    async fn evict_all(&self);
}

/// A cache that never stores and never hits; plugging it in disables
/// caching entirely.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl CacheStore for NoopCache {
    async fn store_payload(&self, _key: &str, _payload: Vec<u8>, _ttl: Duration) {}

    async fn store_file(
        &self,
        _key: &str,
        _source: &Path,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn lookup_payload(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn lookup_file(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    async fn evict_all(&self) {}
}
