//! Presentation boundary: translates execution errors into structured
//! report objects for user-facing layers.
//!
//! The report carries a category, a stable string code, a user-facing
//! message, a technical message, an optional wrapped cause, and contextual
//! data keyed by a closed enum. Anything beyond this translation (how the
//! report is rendered, routed, or localized) belongs to the consumer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::Error;

/// Broad grouping of an error for presentation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportCategory {
    /// The request was malformed before any I/O.
    Request,
    /// Connectivity-level failure.
    Network,
    /// The server failed (5xx or unexpected status).
    Server,
    /// The server refused the request (4xx with decoded model).
    Api,
    /// The response arrived but did not match the expected shape.
    Decode,
    /// Cache lookup or store failure.
    Cache,
    /// File placement or integrity failure.
    File,
    /// A middleware link rejected the response.
    Middleware,
    /// The retry budget was exhausted.
    Retry,
}

impl ReportCategory {
    /// Short human label for the category.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Network => "Network",
            Self::Server => "Server",
            Self::Api => "API",
            Self::Decode => "Decoding",
            Self::Cache => "Cache",
            Self::File => "File",
            Self::Middleware => "Middleware",
            Self::Retry => "Retry",
        }
    }
}

/// Closed set of context keys a report may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextKey {
    /// Request or response URL.
    Url,
    /// HTTP status code.
    Status,
    /// Attempts performed.
    Attempts,
    /// Filesystem path involved.
    Path,
    /// Canonical cache key.
    Key,
    /// Expected digest.
    Expected,
    /// Computed digest.
    Actual,
    /// Name of the rejecting middleware link.
    MiddlewareName,
}

/// Typed context value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    /// Free-form text.
    Text(String),
    /// Numeric value.
    Number(u64),
    /// Filesystem path.
    Path(PathBuf),
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Structured, presentation-ready view of an execution error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Broad grouping.
    pub category: ReportCategory,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Short user-facing message.
    pub message: String,
    /// Full technical message.
    pub technical: String,
    /// Rendered source error, when one exists.
    pub cause: Option<String>,
    /// Contextual data keyed by the closed key set.
    pub context: BTreeMap<ContextKey, ContextValue>,
}

impl<E: fmt::Debug> Error<E> {
    /// Translates this error into a presentation report.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        let mut context = BTreeMap::new();
        let (category, code, message) = match self {
            Self::InvalidRequest(_) => (
                ReportCategory::Request,
                "request.invalid",
                "The request was invalid and was not sent.".to_string(),
            ),
            Self::Network { url, .. } => {
                context.insert(ContextKey::Url, ContextValue::Text(url.clone()));
                (
                    ReportCategory::Network,
                    "network.unreachable",
                    "The server could not be reached.".to_string(),
                )
            }
            Self::Timeout { url } => {
                context.insert(ContextKey::Url, ContextValue::Text(url.clone()));
                (
                    ReportCategory::Network,
                    "network.timeout",
                    "The server did not respond in time.".to_string(),
                )
            }
            Self::Server { url, status, .. } => {
                context.insert(ContextKey::Url, ContextValue::Text(url.clone()));
                context.insert(ContextKey::Status, ContextValue::Number(u64::from(*status)));
                (
                    ReportCategory::Server,
                    "server.status",
                    format!("The server failed with status {status}."),
                )
            }
            Self::Api { status, .. } => {
                context.insert(ContextKey::Status, ContextValue::Number(u64::from(*status)));
                (
                    ReportCategory::Api,
                    "api.status",
                    format!("The server rejected the request with status {status}."),
                )
            }
            Self::Decode { url, .. } => {
                context.insert(ContextKey::Url, ContextValue::Text(url.clone()));
                (
                    ReportCategory::Decode,
                    "decode.shape",
                    "The response did not match the expected format.".to_string(),
                )
            }
            Self::CacheMiss { key } => {
                context.insert(ContextKey::Key, ContextValue::Text(key.clone()));
                (
                    ReportCategory::Cache,
                    "cache.miss",
                    "No cached copy was available.".to_string(),
                )
            }
            Self::File(file_error) => {
                use crate::download::FileError;
                match file_error {
                    FileError::AlreadyExists { path } => {
                        context.insert(ContextKey::Path, ContextValue::Path(path.clone()));
                        (
                            ReportCategory::File,
                            "file.exists",
                            "The destination file already exists.".to_string(),
                        )
                    }
                    FileError::ChecksumMismatch {
                        path,
                        expected,
                        actual,
                    } => {
                        context.insert(ContextKey::Path, ContextValue::Path(path.clone()));
                        context
                            .insert(ContextKey::Expected, ContextValue::Text(expected.clone()));
                        context.insert(ContextKey::Actual, ContextValue::Text(actual.clone()));
                        (
                            ReportCategory::File,
                            "file.checksum",
                            "The downloaded file failed its integrity check.".to_string(),
                        )
                    }
                    FileError::Io { path, .. } => {
                        context.insert(ContextKey::Path, ContextValue::Path(path.clone()));
                        (
                            ReportCategory::File,
                            "file.io",
                            "The file could not be written.".to_string(),
                        )
                    }
                }
            }
            Self::Middleware(rejection) => {
                context.insert(
                    ContextKey::MiddlewareName,
                    ContextValue::Text(rejection.middleware.clone()),
                );
                (
                    ReportCategory::Middleware,
                    "middleware.rejected",
                    "The response was rejected before delivery.".to_string(),
                )
            }
            Self::RetryLimitExceeded { attempts } => {
                context.insert(
                    ContextKey::Attempts,
                    ContextValue::Number(u64::from(*attempts)),
                );
                (
                    ReportCategory::Retry,
                    "retry.exhausted",
                    format!("The request failed after {attempts} attempts."),
                )
            }
        };

        ErrorReport {
            category,
            code,
            message,
            technical: self.to_string(),
            cause: std::error::Error::source(self).map(ToString::to_string),
            context,
        }
    }
}
