//! Request descriptors: the caller-declared, immutable specification of one
//! request's shape and policies.
//!
//! A [`Descriptor`] is built through [`DescriptorBuilder`], which validates
//! method/body/cache-policy compatibility at construction time. Concrete
//! request types implement [`Request`] (or [`DownloadRequest`]) to associate
//! a response type and an error-model type with the descriptor they produce.
//!
//! # Example
//!
//! ```
//! use courier::request::{Descriptor, Method, Request, RequestError};
//! use courier::CachePolicy;
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Debug, Deserialize)]
//! struct User { id: u64, name: String }
//!
//! #[derive(Debug, Deserialize)]
//! struct ApiError { code: String }
//!
//! struct GetUsers;
//!
//! impl Request for GetUsers {
//!     type Response = Vec<User>;
//!     type ErrorModel = ApiError;
//!
//!     fn descriptor(&self) -> Result<Descriptor, RequestError> {
//!         Descriptor::builder(Method::Get, "/users")
//!             .cache_policy(CachePolicy::cache_first(Duration::from_secs(60)))
//!             .build()
//!     }
//! }
//! ```

mod policy;

pub use policy::CachePolicy;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::download::Destination;
use crate::retry::RetryPolicy;

/// HTTP method of a request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - safe, idempotent.
    Get,
    /// HEAD - safe, idempotent.
    Head,
    /// OPTIONS - safe, idempotent.
    Options,
    /// POST - neither safe nor idempotent.
    Post,
    /// PUT - idempotent but not safe.
    Put,
    /// PATCH - neither safe nor idempotent.
    Patch,
    /// DELETE - idempotent but not safe.
    Delete,
}

impl Method {
    /// Returns true for methods guaranteed not to modify server state
    /// (GET, HEAD, OPTIONS). Only safe methods participate in caching.
    #[must_use]
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }

    /// Returns true for methods that are safe to repeat without changing
    /// the outcome of a prior successful call. POST and PATCH are never
    /// idempotent and are therefore never auto-retried.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        self.is_safe() || matches!(self, Self::Put | Self::Delete)
    }

    /// Returns the wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while constructing a request descriptor.
///
/// These are construction-time failures: they surface before any I/O is
/// performed and are never retried.
#[derive(Debug, Error)]
pub enum RequestError {
    /// A safe method (GET/HEAD/OPTIONS) declared a request body.
    #[error("{method} request to {path} must not carry a body")]
    BodyOnSafeMethod {
        /// The offending method.
        method: Method,
        /// The request path.
        path: String,
    },

    /// A non-safe method declared a cache-reading policy.
    #[error("{method} request to {path} must not declare a cache-reading policy")]
    CacheOnUnsafeMethod {
        /// The offending method.
        method: Method,
        /// The request path.
        path: String,
    },

    /// The request path could not be joined onto the client base URL.
    #[error("invalid request path {path}: {reason}")]
    InvalidPath {
        /// The path that failed to parse.
        path: String,
        /// Parser-supplied reason.
        reason: String,
    },

    /// The JSON body value could not be serialized.
    #[error("request body could not be serialized: {reason}")]
    BodySerialization {
        /// Serializer-supplied reason.
        reason: String,
    },
}

/// Immutable specification of one request's shape and policies.
///
/// Construct through [`Descriptor::builder`]; the builder enforces the
/// method/body/cache-policy invariants so an invalid combination never
/// reaches the network.
#[derive(Debug, Clone)]
pub struct Descriptor {
    path: String,
    method: Method,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
    cache_policy: CachePolicy,
    retry_policy: RetryPolicy,
}

impl Descriptor {
    /// Starts building a descriptor for the given method and path.
    ///
    /// The path is joined onto the client base URL per RFC 3986 at
    /// execution time.
    pub fn builder(method: Method, path: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            path: path.into(),
            method,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            cache_policy: CachePolicy::Bypass,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Returns the request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the request-level headers.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Returns the request-level query parameters.
    #[must_use]
    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// Returns the request body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Returns the declared cache policy.
    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Returns the declared retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

/// Builder for [`Descriptor`].
///
/// Defaults: no headers, no query parameters, no body,
/// [`CachePolicy::Bypass`], [`RetryPolicy::default`].
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    path: String,
    method: Method,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
    cache_policy: CachePolicy,
    retry_policy: RetryPolicy,
}

impl DescriptorBuilder {
    /// Adds a request header. Replaces any prior value for the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a query parameter. Replaces any prior value for the same key.
    #[must_use]
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Sets a raw request body.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Serializes a value as the JSON request body.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::BodySerialization`] if the value cannot be
    /// serialized.
    pub fn json_body<T: Serialize>(mut self, value: &T) -> Result<Self, RequestError> {
        let bytes = serde_json::to_vec(value).map_err(|e| RequestError::BodySerialization {
            reason: e.to_string(),
        })?;
        self.body = Some(bytes);
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(self)
    }

    /// Sets the cache policy.
    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Finalizes the descriptor, validating method/body/cache-policy
    /// compatibility.
    ///
    /// # Errors
    ///
    /// - [`RequestError::BodyOnSafeMethod`] when a safe method carries a body
    /// - [`RequestError::CacheOnUnsafeMethod`] when a non-safe method
    ///   declares a cache-reading policy
    pub fn build(self) -> Result<Descriptor, RequestError> {
        if self.method.is_safe() && self.body.is_some() {
            return Err(RequestError::BodyOnSafeMethod {
                method: self.method,
                path: self.path,
            });
        }
        if !self.method.is_safe() && self.cache_policy.reads_cache() {
            return Err(RequestError::CacheOnUnsafeMethod {
                method: self.method,
                path: self.path,
            });
        }
        Ok(Descriptor {
            path: self.path,
            method: self.method,
            headers: self.headers,
            query: self.query,
            body: self.body,
            cache_policy: self.cache_policy,
            retry_policy: self.retry_policy,
        })
    }
}

/// A typed, executable request: descriptor plus associated response and
/// error-model types.
///
/// Dispatch is static: the orchestrator is generic over the implementor, so
/// each concrete request variant carries its decode types with no runtime
/// reflection.
pub trait Request: Send + Sync {
    /// Decoded type of a 2xx response body.
    type Response: DeserializeOwned + Send;
    /// Decoded type of a 4xx response body.
    type ErrorModel: DeserializeOwned + fmt::Debug + Send;

    /// Produces the descriptor for one call.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the declared shape violates a
    /// construction-time invariant.
    fn descriptor(&self) -> Result<Descriptor, RequestError>;
}

/// A typed download request: descriptor, destination, and the error-model
/// type decoded from 4xx responses.
pub trait DownloadRequest: Send + Sync {
    /// Decoded type of a 4xx response body.
    type ErrorModel: DeserializeOwned + fmt::Debug + Send;

    /// Produces the descriptor for one call.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the declared shape violates a
    /// construction-time invariant.
    fn descriptor(&self) -> Result<Descriptor, RequestError>;

    /// Where the downloaded file should be placed, and under what rules.
    fn destination(&self) -> Destination;
}
