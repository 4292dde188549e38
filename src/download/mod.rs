//! Download finalization: moving a transport-delivered temp file to its
//! destination, enforcing overwrite rules and verifying integrity, plus
//! the progress event stream for observed downloads.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::error::Error;
use crate::transport::TempDownload;

/// Hash algorithm for download integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

/// Declared content checksum: algorithm plus expected hex digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// The hash algorithm.
    pub algorithm: ChecksumAlgorithm,
    /// Expected digest, hex-encoded (case-insensitive).
    pub digest: String,
}

impl Checksum {
    /// SHA-256 checksum with the given hex digest.
    pub fn sha256(digest: impl Into<String>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            digest: digest.into(),
        }
    }

    /// SHA-512 checksum with the given hex digest.
    pub fn sha512(digest: impl Into<String>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha512,
            digest: digest.into(),
        }
    }
}

/// Where a download lands and under what rules.
#[derive(Debug, Clone)]
pub struct Destination {
    /// Final path for the downloaded file.
    pub path: PathBuf,
    /// Whether an existing file at the path may be replaced.
    pub overwrite: bool,
    /// Optional integrity check, verified after placement.
    pub checksum: Option<Checksum>,
}

impl Destination {
    /// Destination at the given path; no overwrite, no checksum.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overwrite: false,
            checksum: None,
        }
    }

    /// Allows or forbids replacing an existing file.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Declares a content checksum.
    #[must_use]
    pub fn checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// File placement and integrity errors. All variants are terminal: none is
/// ever retried automatically.
#[derive(Debug, Error)]
pub enum FileError {
    /// The destination exists and overwrite was not allowed.
    #[error("destination {path} already exists")]
    AlreadyExists {
        /// The occupied destination path.
        path: PathBuf,
    },

    /// The placed file's digest does not match the declared checksum.
    ///
    /// The file is left at its destination for caller inspection; it must
    /// be treated as untrustworthy.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The placed (untrustworthy) file.
        path: PathBuf,
        /// Declared digest, lowercased.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// Disk failure while placing or hashing the file.
    #[error("IO error for {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Moves a spooled download to its destination.
///
/// The destination is checked against the overwrite rule, intermediate
/// directories are created, the temp file is moved into place (rename,
/// with a copy fallback when the rename crosses filesystems), and the
/// declared checksum, if any, is verified against the file at its final
/// location.
///
/// # Errors
///
/// - [`FileError::AlreadyExists`] when the destination is occupied and
///   overwrite is off
/// - [`FileError::ChecksumMismatch`] on an integrity failure (the placed
///   file stays on disk)
/// - [`FileError::Io`] on disk failure
#[instrument(level = "debug", skip(temp, destination), fields(dest = %destination.path.display()))]
pub async fn finalize(
    temp: TempDownload,
    destination: &Destination,
) -> Result<PathBuf, FileError> {
    let dest = &destination.path;
    prepare_destination(destination).await?;

    let temp_path = temp.into_temp_path();
    if let Err(persist_err) = temp_path.persist(dest) {
        // Rename failed (typically a cross-filesystem move); fall back to a
        // copy. The temp guard inside the error still cleans up the spool.
        debug!(error = %persist_err.error, "rename failed, copying instead");
        let spool = persist_err.path;
        tokio::fs::copy(&spool, dest)
            .await
            .map_err(|e| FileError::io(dest.clone(), e))?;
    }

    verify_checksum(dest, destination.checksum.as_ref()).await?;
    debug!("download finalized");
    Ok(dest.clone())
}

/// Places a copy of an existing file (a cache hit) at the destination,
/// under the same overwrite and checksum rules as [`finalize`]. The source
/// is left untouched.
///
/// # Errors
///
/// Same as [`finalize`].
pub async fn place_copy(source: &Path, destination: &Destination) -> Result<PathBuf, FileError> {
    let dest = &destination.path;
    prepare_destination(destination).await?;

    tokio::fs::copy(source, dest)
        .await
        .map_err(|e| FileError::io(dest.clone(), e))?;

    verify_checksum(dest, destination.checksum.as_ref()).await?;
    Ok(dest.clone())
}

async fn prepare_destination(destination: &Destination) -> Result<(), FileError> {
    let dest = &destination.path;
    let occupied = tokio::fs::metadata(dest).await.is_ok();
    if occupied {
        if !destination.overwrite {
            return Err(FileError::AlreadyExists { path: dest.clone() });
        }
        tokio::fs::remove_file(dest)
            .await
            .map_err(|e| FileError::io(dest.clone(), e))?;
    }
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::io(parent.to_path_buf(), e))?;
        }
    }
    Ok(())
}

async fn verify_checksum(path: &Path, checksum: Option<&Checksum>) -> Result<(), FileError> {
    let Some(checksum) = checksum else {
        return Ok(());
    };
    let actual = hash_file(path, checksum.algorithm)
        .await
        .map_err(|e| FileError::io(path.to_path_buf(), e))?;
    let expected = checksum.digest.trim().to_ascii_lowercase();
    if actual != expected {
        return Err(FileError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Hashes the file at `path`, returning a lowercase hex digest.
async fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, std::io::Error> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => hash_reader::<Sha256>(path).await,
        ChecksumAlgorithm::Sha512 => hash_reader::<Sha512>(path).await,
    }
}

async fn hash_reader<D: Digest>(path: &Path) -> Result<String, std::io::Error>
where
    <D as sha2::digest::OutputSizeUser>::OutputSize: core::ops::Add,
    <<D as sha2::digest::OutputSizeUser>::OutputSize as core::ops::Add>::Output:
        sha2::digest::generic_array::ArrayLength<u8>,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// One event from an observed download.
#[derive(Debug)]
pub enum DownloadEvent<E> {
    /// Monotonically non-decreasing completion fraction in `[0, 1]`.
    /// Suppressed entirely when the expected size is zero or unknown.
    Progress(f64),

    /// Terminal outcome; the stream ends after this event.
    Finished(Result<PathBuf, Error<E>>),
}

/// Lazy event sequence produced by an observed download.
///
/// Dropping the stream aborts the producer task, terminating the
/// underlying exchange as a best-effort cleanup. Restart only by issuing
/// a new call.
#[derive(Debug)]
pub struct DownloadProgress<E> {
    events: mpsc::Receiver<DownloadEvent<E>>,
    producer: tokio::task::JoinHandle<()>,
}

impl<E> DownloadProgress<E> {
    pub(crate) fn new(
        events: mpsc::Receiver<DownloadEvent<E>>,
        producer: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self { events, producer }
    }
}

impl<E> Stream for DownloadProgress<E> {
    type Item = DownloadEvent<E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl<E> Drop for DownloadProgress<E> {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
