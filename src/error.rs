//! Error taxonomy for request execution.
//!
//! [`Error`] is generic over the request's declared error-model type: a
//! 4xx response decodes into that type and surfaces as [`Error::Api`].
//! Every variant maps to exactly one [`ErrorClass`], which is what the
//! retry controller consults; terminal kinds are never retried.
//!
//! Helper constructors carry the context the underlying errors lack; no
//! blanket `From` impls for transport or IO errors exist on purpose.

use thiserror::Error;

use crate::download::FileError;
use crate::middleware::Rejection;
use crate::request::RequestError;
use crate::retry::ErrorClass;
use crate::transport::TransportError;

/// Errors produced by request execution, generic over the request's
/// error-model type `E`.
#[derive(Debug, Error)]
pub enum Error<E> {
    /// The descriptor violated a construction-time invariant. Surfaced
    /// before any I/O; never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// Connectivity, DNS, or TLS failure. Retried per policy.
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The exchange timed out. Retried per policy.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server answered with a non-2xx, non-4xx status. Retried per
    /// policy. Carries the raw status and body.
    #[error("HTTP {status} from {url}")]
    Server {
        /// Final URL of the exchange.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw response body.
        body: Vec<u8>,
    },

    /// The server answered 4xx and the body decoded into the request's
    /// declared error model. Terminal.
    #[error("HTTP {status} API error")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The decoded error model.
        model: E,
    },

    /// A response body did not match the expected shape. Terminal: the
    /// data already arrived, a retry would not help.
    #[error("could not decode response from {url}: {source}")]
    Decode {
        /// The URL whose response failed to decode.
        url: String,
        /// The decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// A cache-only request found no valid entry. Terminal; the transport
    /// was never invoked.
    #[error("no valid cache entry for {key}")]
    CacheMiss {
        /// The canonical cache key.
        key: String,
    },

    /// File placement or integrity failure. Terminal; "already exists"
    /// and "checksum mismatch" are distinct, unambiguous variants of the
    /// source error.
    #[error(transparent)]
    File(#[from] FileError),

    /// A middleware link rejected the response. Terminal; the rejection
    /// carries a typed reason.
    #[error(transparent)]
    Middleware(#[from] Rejection),

    /// The retry budget was exhausted. Emitted instead of the last
    /// underlying error so callers can detect exhaustion directly.
    #[error("retry limit exceeded after {attempts} attempts")]
    RetryLimitExceeded {
        /// Attempts performed, including the first try.
        attempts: u32,
    },
}

impl<E> Error<E> {
    /// The retry-eligibility class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::Network,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Server { .. } => ErrorClass::Server,
            Self::InvalidRequest(_)
            | Self::Api { .. }
            | Self::Decode { .. }
            | Self::CacheMiss { .. }
            | Self::File(_)
            | Self::Middleware(_)
            | Self::RetryLimitExceeded { .. } => ErrorClass::Terminal,
        }
    }

    /// Creates a decode error.
    pub(crate) fn decode(url: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            url: url.into(),
            source,
        }
    }

    /// Maps a transport failure into the engine taxonomy.
    pub(crate) fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::Network { url, source } => Self::Network { url, source },
            TransportError::Timeout { url } => Self::Timeout { url },
            TransportError::Io { path, source } => Self::File(FileError::io(path, source)),
        }
    }
}
