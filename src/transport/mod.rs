//! Transport boundary: a single request/response exchange, data or
//! streaming-download shaped.
//!
//! The engine only requires the two capabilities expressed by the
//! [`Transport`] trait. TLS, connection pooling, and redirect policy are
//! transport responsibilities; the engine never sees them. A non-2xx
//! status is data, not a transport error: classification happens in the
//! orchestrator after middleware has run.

mod http;

pub use http::HttpTransport;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::request::Method;

/// Callback invoked by a downloading transport with
/// `(bytes_so_far, expected_total)`. The expected total is `None` when the
/// server did not announce a content length.
pub type ProgressObserver = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// The fully-built wire request handed to the transport after default
/// merging and middleware `prepare`.
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Absolute request URL, query already canonicalized.
    pub url: Url,
    /// HTTP method.
    pub method: Method,
    /// Merged headers, request-level values winning over client defaults.
    pub headers: BTreeMap<String, String>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
}

/// The protocol-level view of a transport result.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Numeric HTTP status; 0 when the exchange produced no HTTP response.
    pub status: u16,
    /// Response headers (names lowercased; non-UTF-8 values skipped).
    pub headers: BTreeMap<String, String>,
    /// Final URL of the exchange, after any transport-level redirects.
    pub url: String,
}

/// Normalized view over a transport result, as seen by middleware
/// `process` and the classifier. Exactly one of `payload`/`file` is
/// populated depending on the call shape.
#[derive(Debug, Clone)]
pub struct ProcessedResponse {
    /// In-memory response body, for data exchanges.
    pub payload: Option<Vec<u8>>,
    /// On-disk body location, for download exchanges.
    pub file: Option<PathBuf>,
    /// The raw protocol response.
    pub raw: RawResponse,
}

impl ProcessedResponse {
    /// Normalizes a data exchange.
    #[must_use]
    pub fn from_payload(payload: Vec<u8>, raw: RawResponse) -> Self {
        Self {
            payload: Some(payload),
            file: None,
            raw,
        }
    }

    /// Normalizes a download exchange.
    #[must_use]
    pub fn from_file(file: PathBuf, raw: RawResponse) -> Self {
        Self {
            payload: None,
            file: Some(file),
            raw,
        }
    }

    /// Derived numeric status code (0 if not an HTTP response).
    #[must_use]
    pub fn status(&self) -> u16 {
        self.raw.status
    }
}

/// A transport-delivered file pending finalization.
///
/// The underlying temp file is deleted on drop, so a failed attempt never
/// leaves a partial artifact behind; finalization consumes the guard and
/// persists the file to its destination.
#[derive(Debug)]
pub struct TempDownload {
    temp: tempfile::TempPath,
}

impl TempDownload {
    /// Wraps a temp path produced by the transport.
    #[must_use]
    pub fn new(temp: tempfile::TempPath) -> Self {
        Self { temp }
    }

    /// Wraps a named temp file, closing its handle.
    #[must_use]
    pub fn from_file(file: tempfile::NamedTempFile) -> Self {
        Self {
            temp: file.into_temp_path(),
        }
    }

    /// Location of the spooled bytes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.temp
    }

    /// Releases the guard for finalization.
    pub(crate) fn into_temp_path(self) -> tempfile::TempPath {
        self.temp
    }
}

/// Errors raised by a transport exchange.
///
/// The `source` boxes keep the trait agnostic of the concrete HTTP stack.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connectivity, DNS, or TLS failure.
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The exchange timed out.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Local disk failure while spooling a download.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The spool path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// Creates a network error.
    pub fn network(
        url: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            url: url.into(),
            source: Box::new(source),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A single request/response exchange capability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one exchange, buffering the response body in memory.
    ///
    /// Non-2xx statuses are returned as data; only connectivity-level
    /// failures are errors.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on network failure or timeout.
    async fn send(&self, request: WireRequest) -> Result<(Vec<u8>, RawResponse), TransportError>;

    /// Performs one exchange, streaming the response body to a temp file.
    ///
    /// The observer, when present, is invoked as chunks arrive.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on network failure, timeout, or spool
    /// IO failure.
    async fn send_download(
        &self,
        request: WireRequest,
        progress: Option<ProgressObserver>,
    ) -> Result<(TempDownload, RawResponse), TransportError>;
}
