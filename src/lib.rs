//! Courier: a declarative HTTP request engine.
//!
//! Given a typed request descriptor, the engine builds the wire request,
//! runs it through a middleware chain, executes it over a pluggable
//! transport, classifies the response, serves or populates a TTL cache,
//! retries transient failures with backoff, and streams downloads to disk
//! with progress reporting and integrity verification.
//!
//! # Architecture
//!
//! - [`client`] - the request orchestrator ([`Client`])
//! - [`request`] - typed descriptors, builder, and policies
//! - [`retry`] - backoff strategies and retry eligibility
//! - [`middleware`] - ordered request/response transformers
//! - [`transport`] - the exchange boundary and its reqwest implementation
//! - [`cache`] - pluggable TTL cache store
//! - [`download`] - file finalization, checksums, and progress streams
//! - [`error`] / [`report`] - the error taxonomy and its presentation
//!   boundary

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod client;
pub mod download;
pub mod error;
pub mod middleware;
pub mod report;
pub mod request;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheStore, DiskCache, NoopCache};
pub use client::{Client, ClientBuilder};
pub use download::{
    Checksum, ChecksumAlgorithm, Destination, DownloadEvent, DownloadProgress, FileError,
};
pub use error::Error;
pub use middleware::{Middleware, RejectReason, Rejection};
pub use report::{ContextKey, ContextValue, ErrorReport, ReportCategory};
pub use request::{
    CachePolicy, Descriptor, DescriptorBuilder, DownloadRequest, Method, Request, RequestError,
};
pub use retry::{Backoff, ErrorClass, RetryPolicy};
pub use transport::{HttpTransport, ProcessedResponse, RawResponse, Transport, TransportError};
