//! Middleware chain: ordered request and response transformers.
//!
//! Links run sequentially in declaration order, never concurrently, for a
//! given request. `prepare` is total: a link that wants to refuse a request
//! can only do so in `process`, after the round trip (a known gap in the
//! chain design, kept as-is). A `process` error short-circuits the
//! remaining links and surfaces as [`Rejection`].

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::transport::{ProcessedResponse, WireRequest};

/// Structured reason a middleware link rejected a response.
///
/// Callers branch on the variant, not on message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The exchange lacked valid credentials.
    Unauthenticated,

    /// The response payload failed a validation check.
    InvalidPayload {
        /// What the check found.
        detail: String,
    },

    /// The response violates a configured policy.
    PolicyViolation {
        /// The rule that fired.
        rule: String,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => f.write_str("unauthenticated"),
            Self::InvalidPayload { detail } => write!(f, "invalid payload: {detail}"),
            Self::PolicyViolation { rule } => write!(f, "policy violation: {rule}"),
        }
    }
}

/// A middleware link refused the response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("middleware {middleware} rejected the response: {reason}")]
pub struct Rejection {
    /// Name of the rejecting link.
    pub middleware: String,
    /// Why it rejected.
    pub reason: RejectReason,
}

impl Rejection {
    /// Creates a rejection attributed to the named link.
    pub fn new(middleware: impl Into<String>, reason: RejectReason) -> Self {
        Self {
            middleware: middleware.into(),
            reason,
        }
    }
}

/// One link in the middleware chain.
///
/// Both hooks default to the identity, so a link only overrides the side
/// it cares about.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Transforms the wire request before send. Total: cannot fail. A link
    /// may fully replace the request.
    async fn prepare(&self, request: WireRequest) -> WireRequest {
        request
    }

    /// Transforms the normalized response after receive, or rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection`] to refuse the response; remaining links are
    /// skipped.
    async fn process(&self, response: ProcessedResponse) -> Result<ProcessedResponse, Rejection> {
        Ok(response)
    }
}
