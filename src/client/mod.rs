//! Request orchestrator: builds the wire request, consults the cache, runs
//! middleware, invokes the transport, classifies the status, and drives
//! caching and retries.
//!
//! A [`Client`] is the single logical owner of its configuration but
//! supports any number of concurrent in-flight requests: every call is an
//! independent unit of work, sharing only the cache and the transport,
//! which serialize internally.
//!
//! # Example
//!
//! ```no_run
//! use courier::{Client, request::{Descriptor, Method, Request, RequestError}};
//! use serde::Deserialize;
//! use url::Url;
//!
//! #[derive(Debug, Deserialize)]
//! struct User { id: u64 }
//!
//! #[derive(Debug, Deserialize)]
//! struct ApiFault { code: String }
//!
//! struct GetUsers;
//!
//! impl Request for GetUsers {
//!     type Response = Vec<User>;
//!     type ErrorModel = ApiFault;
//!     fn descriptor(&self) -> Result<Descriptor, RequestError> {
//!         Descriptor::builder(Method::Get, "/users").build()
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder(Url::parse("https://api.test")?).build();
//! let users = client.execute(&GetUsers).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{CacheStore, NoopCache};
use crate::download::{self, Destination, DownloadEvent, DownloadProgress};
use crate::error::Error;
use crate::middleware::Middleware;
use crate::request::{
    CachePolicy, Descriptor, DownloadRequest, Method, Request, RequestError,
};
use crate::retry::{ErrorClass, RetryPolicy};
use crate::transport::{
    HttpTransport, ProcessedResponse, ProgressObserver, RawResponse, TempDownload, Transport,
    WireRequest,
};

/// Capacity of the progress event channel. Progress deliveries are lossy
/// under backpressure; the terminal event is always delivered.
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// The request execution engine.
///
/// Construct through [`Client::builder`]. Cloning is cheap: configuration
/// is shared behind `Arc`s.
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheStore>,
    middleware: Arc<[Arc<dyn Middleware>]>,
    default_headers: BTreeMap<String, String>,
    default_query: BTreeMap<String, String>,
    default_body: Option<Vec<u8>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url.as_str())
            .field("middleware_links", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Client`].
///
/// Defaults: [`HttpTransport`] with standard timeouts, [`NoopCache`]
/// (caching disabled), no middleware, no default headers/query/body.
pub struct ClientBuilder {
    base_url: Url,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn CacheStore>>,
    middleware: Vec<Arc<dyn Middleware>>,
    default_headers: BTreeMap<String, String>,
    default_query: BTreeMap<String, String>,
    default_body: Option<Vec<u8>>,
}

impl ClientBuilder {
    fn new(base_url: Url) -> Self {
        Self {
            base_url,
            transport: None,
            cache: None,
            middleware: Vec::new(),
            default_headers: BTreeMap::new(),
            default_query: BTreeMap::new(),
            default_body: None,
        }
    }

    /// Replaces the transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the cache store.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Appends a middleware link; links run in the order they were added.
    #[must_use]
    pub fn middleware(mut self, link: Arc<dyn Middleware>) -> Self {
        self.middleware.push(link);
        self
    }

    /// Adds a client-level default header. Request-level values win on
    /// collision.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Adds a client-level default query parameter. Request-level values
    /// win on collision.
    #[must_use]
    pub fn default_query_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_query.insert(key.into(), value.into());
        self
    }

    /// Sets a client-level default body, used when a request declares
    /// none.
    #[must_use]
    pub fn default_body(mut self, body: Vec<u8>) -> Self {
        self.default_body = Some(body);
        self
    }

    /// Finalizes the client.
    #[must_use]
    pub fn build(self) -> Client {
        Client {
            base_url: self.base_url,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(HttpTransport::new())),
            cache: self.cache.unwrap_or_else(|| Arc::new(NoopCache)),
            middleware: self.middleware.into(),
            default_headers: self.default_headers,
            default_query: self.default_query,
            default_body: self.default_body,
        }
    }
}

/// Decision after a failed attempt.
enum NextStep {
    /// Sleep, then run the next attempt.
    Retry(Duration),
    /// The budget is spent; report exhaustion.
    Exhausted,
    /// The error is not retryable; surface it as-is.
    Propagate,
}

impl Client {
    /// Starts building a client rooted at the given base URL.
    #[must_use]
    pub fn builder(base_url: Url) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    /// Executes a data request and decodes the response.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] per the execution taxonomy; retryable failures
    /// are retried transparently and the caller only ever sees the final
    /// outcome.
    #[instrument(level = "debug", skip(self, request))]
    pub async fn execute<R: Request>(
        &self,
        request: &R,
    ) -> Result<R::Response, Error<R::ErrorModel>> {
        let descriptor = request.descriptor()?;
        let wire = self.build_wire(&descriptor)?;
        let key = wire.url.as_str().to_string();
        let policy = descriptor.cache_policy();

        if descriptor.method().is_safe() && policy.reads_cache() {
            if let Some(bytes) = self.cache.lookup_payload(&key).await {
                debug!(key, "cache hit");
                return decode_payload(&bytes, &key);
            }
            if matches!(policy, CachePolicy::CacheOnly) {
                return Err(Error::CacheMiss { key });
            }
            debug!(key, "cache miss");
        }

        let retry = descriptor.retry_policy().clone();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.data_attempt::<R::ErrorModel>(&wire).await {
                Ok((payload, raw)) => {
                    let decoded = decode_payload(&payload, &raw.url)?;
                    if descriptor.method().is_safe() {
                        if let Some(ttl) = policy.store_ttl() {
                            self.cache.store_payload(&key, payload, ttl).await;
                        }
                    }
                    return Ok(decoded);
                }
                Err(error) => match next_step(descriptor.method(), &retry, &error, attempts) {
                    NextStep::Propagate => return Err(error),
                    NextStep::Exhausted => {
                        warn!(attempts, error = %error, "retry budget exhausted");
                        return Err(Error::RetryLimitExceeded { attempts });
                    }
                    NextStep::Retry(delay) => {
                        warn!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "attempt failed, will retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }

    /// Executes a download request, placing the file at its destination.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Client::execute`], plus the terminal file
    /// outcomes: an occupied destination without overwrite fails before
    /// any transport work, and a checksum mismatch after placement is an
    /// integrity failure.
    #[instrument(level = "debug", skip(self, request))]
    pub async fn execute_download<R: DownloadRequest>(
        &self,
        request: &R,
    ) -> Result<PathBuf, Error<R::ErrorModel>> {
        let descriptor = request.descriptor()?;
        self.download_inner(descriptor, request.destination(), None)
            .await
    }

    /// Executes a download request, returning a lazy stream of progress
    /// fractions followed by the terminal outcome.
    ///
    /// Progress is monotonically non-decreasing in `[0, 1]`; when the
    /// expected size is zero or unknown, no progress events are emitted.
    /// Dropping the stream aborts the work; restart only by calling
    /// again.
    pub fn execute_download_with_progress<R>(
        &self,
        request: &R,
    ) -> DownloadProgress<R::ErrorModel>
    where
        R: DownloadRequest,
        R::ErrorModel: 'static,
    {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let descriptor = request.descriptor();
        let destination = request.destination();
        let client = self.clone();

        let producer = tokio::spawn(async move {
            let descriptor = match descriptor {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    let _ = tx
                        .send(DownloadEvent::Finished(Err(Error::InvalidRequest(error))))
                        .await;
                    return;
                }
            };

            let reported = Arc::new(AtomicU64::new(0));
            let progress_tx = tx.clone();
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let observer: ProgressObserver = Arc::new(move |written, expected| {
                let Some(total) = expected else { return };
                if total == 0 {
                    return;
                }
                let fraction = (written as f64 / total as f64).clamp(0.0, 1.0);
                // Monotonicity gate: only strictly increasing fractions go
                // out, keyed on a fixed-point image of the fraction.
                let scaled = (fraction * 1_000_000.0) as u64;
                let previous = reported.fetch_max(scaled, Ordering::Relaxed);
                if scaled > previous {
                    let _ = progress_tx.try_send(DownloadEvent::Progress(fraction));
                }
            });

            let result = client
                .download_inner(descriptor, destination, Some(observer))
                .await;
            let _ = tx.send(DownloadEvent::Finished(result)).await;
        });

        DownloadProgress::new(rx, producer)
    }

    async fn download_inner<Em>(
        &self,
        descriptor: Descriptor,
        destination: Destination,
        observer: Option<ProgressObserver>,
    ) -> Result<PathBuf, Error<Em>>
    where
        Em: DeserializeOwned + fmt::Debug + Send,
    {
        // A doomed download must never touch the network.
        if !destination.overwrite && tokio::fs::metadata(&destination.path).await.is_ok() {
            return Err(Error::File(crate::download::FileError::AlreadyExists {
                path: destination.path.clone(),
            }));
        }

        let wire = self.build_wire(&descriptor)?;
        let key = wire.url.as_str().to_string();
        let policy = descriptor.cache_policy();

        if descriptor.method().is_safe() && policy.reads_cache() {
            if let Some(cached) = self.cache.lookup_file(&key).await {
                debug!(key, "download cache hit");
                return Ok(download::place_copy(&cached, &destination).await?);
            }
            if matches!(policy, CachePolicy::CacheOnly) {
                return Err(Error::CacheMiss { key });
            }
            debug!(key, "download cache miss");
        }

        let retry = descriptor.retry_policy().clone();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self
                .download_attempt::<Em>(&wire, observer.clone())
                .await
            {
                Ok(temp) => {
                    let placed = download::finalize(temp, &destination).await?;
                    if descriptor.method().is_safe() {
                        if let Some(ttl) = policy.store_ttl() {
                            // The download itself succeeded; a failed cache
                            // store only costs the next call a refetch.
                            if let Err(error) = self.cache.store_file(&key, &placed, ttl).await {
                                warn!(key, error = %error, "failed to cache downloaded file");
                            }
                        }
                    }
                    info!(path = %placed.display(), "download complete");
                    return Ok(placed);
                }
                Err(error) => match next_step(descriptor.method(), &retry, &error, attempts) {
                    NextStep::Propagate => return Err(error),
                    NextStep::Exhausted => {
                        warn!(attempts, error = %error, "retry budget exhausted");
                        return Err(Error::RetryLimitExceeded { attempts });
                    }
                    NextStep::Retry(delay) => {
                        warn!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "download attempt failed, will retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }

    /// One data attempt: prepare, send, process, classify.
    async fn data_attempt<Em>(
        &self,
        wire: &WireRequest,
    ) -> Result<(Vec<u8>, RawResponse), Error<Em>>
    where
        Em: DeserializeOwned + fmt::Debug + Send,
    {
        let mut request = wire.clone();
        for link in self.middleware.iter() {
            request = link.prepare(request).await;
        }

        let (payload, raw) = self
            .transport
            .send(request)
            .await
            .map_err(Error::from_transport)?;

        let mut response = ProcessedResponse::from_payload(payload, raw);
        for link in self.middleware.iter() {
            response = link.process(response).await?;
        }

        let status = response.status();
        let payload = response.payload.unwrap_or_default();
        let raw = response.raw;
        match status {
            200..=299 => Ok((payload, raw)),
            400..=499 => {
                let model =
                    serde_json::from_slice(&payload).map_err(|e| Error::decode(&raw.url, e))?;
                Err(Error::Api { status, model })
            }
            _ => Err(Error::Server {
                url: raw.url,
                status,
                body: payload,
            }),
        }
    }

    /// One download attempt: prepare, stream, process, classify. On a
    /// non-2xx status the spooled body is read back for classification
    /// and the temp file is dropped (removed) with the attempt.
    async fn download_attempt<Em>(
        &self,
        wire: &WireRequest,
        observer: Option<ProgressObserver>,
    ) -> Result<TempDownload, Error<Em>>
    where
        Em: DeserializeOwned + fmt::Debug + Send,
    {
        let mut request = wire.clone();
        for link in self.middleware.iter() {
            request = link.prepare(request).await;
        }

        let (temp, raw) = self
            .transport
            .send_download(request, observer)
            .await
            .map_err(Error::from_transport)?;

        let mut response = ProcessedResponse::from_file(temp.path().to_path_buf(), raw);
        for link in self.middleware.iter() {
            response = link.process(response).await?;
        }

        let status = response.status();
        match status {
            200..=299 => Ok(temp),
            400..=499 => {
                let body = tokio::fs::read(temp.path()).await.unwrap_or_default();
                let model = serde_json::from_slice(&body)
                    .map_err(|e| Error::decode(&response.raw.url, e))?;
                Err(Error::Api { status, model })
            }
            _ => {
                let body = tokio::fs::read(temp.path()).await.unwrap_or_default();
                Err(Error::Server {
                    url: response.raw.url,
                    status,
                    body,
                })
            }
        }
    }

    /// Merges client defaults with the descriptor and produces the wire
    /// request. Request-level values win on key collision. The resulting
    /// URL, with its sorted query, is the canonical cache key.
    fn build_wire(&self, descriptor: &Descriptor) -> Result<WireRequest, RequestError> {
        let mut url =
            self.base_url
                .join(descriptor.path())
                .map_err(|e| RequestError::InvalidPath {
                    path: descriptor.path().to_string(),
                    reason: e.to_string(),
                })?;

        let mut query = self.default_query.clone();
        query.extend(
            descriptor
                .query()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if !query.is_empty() {
            // BTreeMap iteration is key-sorted, which canonicalizes the
            // query for cache addressing.
            url.query_pairs_mut().clear().extend_pairs(query.iter());
        }

        let mut headers = self.default_headers.clone();
        headers.extend(
            descriptor
                .headers()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let body = descriptor
            .body()
            .map(<[u8]>::to_vec)
            .or_else(|| self.default_body.clone());

        Ok(WireRequest {
            url,
            method: descriptor.method(),
            headers,
            body,
        })
    }
}

/// Retry gate: idempotent method, policy-eligible class, attempts
/// remaining. Exhaustion is reported distinctly from the underlying
/// error.
fn next_step<Em>(
    method: Method,
    policy: &RetryPolicy,
    error: &Error<Em>,
    attempts: u32,
) -> NextStep {
    let class = error.class();
    if class == ErrorClass::Terminal || !method.is_idempotent() || !policy.eligible(class) {
        return NextStep::Propagate;
    }
    if attempts >= policy.max_attempts() {
        return NextStep::Exhausted;
    }
    // The delay index is 0-based from the first retry.
    NextStep::Retry(policy.delay(attempts - 1))
}

fn decode_payload<T, Em>(bytes: &[u8], url: &str) -> Result<T, Error<Em>>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(bytes).map_err(|e| Error::decode(url, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde::Deserialize;
    use sha2::Digest;
    use tempfile::TempDir;

    use crate::cache::DiskCache;
    use crate::download::{Checksum, FileError};
    use crate::middleware::{RejectReason, Rejection};
    use crate::retry::Backoff;
    use crate::transport::TransportError;

    #[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
    struct User {
        id: u64,
        name: String,
    }

    #[derive(Debug, Deserialize, PartialEq, Eq)]
    struct ApiFault {
        code: String,
    }

    const USERS_JSON: &[u8] = br#"[{"id":1,"name":"ada"}]"#;

    /// Scripted transport: pops one outcome per exchange and counts
    /// invocations.
    struct MockTransport {
        outcomes: Mutex<VecDeque<MockOutcome>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<WireRequest>>,
    }

    enum MockOutcome {
        Respond { status: u16, body: Vec<u8> },
        NetworkFailure,
    }

    impl MockTransport {
        fn new(outcomes: Vec<MockOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> WireRequest {
            self.requests.lock().unwrap().last().unwrap().clone()
        }

        fn next_outcome(&self, request: &WireRequest) -> MockOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock transport ran out of scripted outcomes")
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            request: WireRequest,
        ) -> Result<(Vec<u8>, RawResponse), TransportError> {
            match self.next_outcome(&request) {
                MockOutcome::Respond { status, body } => Ok((
                    body,
                    RawResponse {
                        status,
                        headers: BTreeMap::new(),
                        url: request.url.to_string(),
                    },
                )),
                MockOutcome::NetworkFailure => Err(TransportError::network(
                    request.url.to_string(),
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                )),
            }
        }

        async fn send_download(
            &self,
            request: WireRequest,
            progress: Option<ProgressObserver>,
        ) -> Result<(TempDownload, RawResponse), TransportError> {
            match self.next_outcome(&request) {
                MockOutcome::Respond { status, body } => {
                    if let Some(observer) = &progress {
                        let total = body.len() as u64;
                        let quarter = (total / 4).max(1);
                        let mut written = 0;
                        while written < total {
                            written = (written + quarter).min(total);
                            observer(written, Some(total));
                        }
                    }
                    let mut file = tempfile::NamedTempFile::new()
                        .map_err(|e| TransportError::io("spool", e))?;
                    file.write_all(&body)
                        .map_err(|e| TransportError::io("spool", e))?;
                    file.flush().map_err(|e| TransportError::io("spool", e))?;
                    Ok((
                        TempDownload::from_file(file),
                        RawResponse {
                            status,
                            headers: BTreeMap::new(),
                            url: request.url.to_string(),
                        },
                    ))
                }
                MockOutcome::NetworkFailure => Err(TransportError::network(
                    request.url.to_string(),
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                )),
            }
        }
    }

    fn ok(body: &[u8]) -> MockOutcome {
        MockOutcome::Respond {
            status: 200,
            body: body.to_vec(),
        }
    }

    fn status(code: u16) -> MockOutcome {
        MockOutcome::Respond {
            status: code,
            body: Vec::new(),
        }
    }

    struct GetUsers {
        cache_policy: CachePolicy,
        retry_policy: RetryPolicy,
    }

    impl GetUsers {
        fn plain() -> Self {
            Self {
                cache_policy: CachePolicy::Bypass,
                retry_policy: RetryPolicy::none(),
            }
        }

        fn cached(ttl: Duration) -> Self {
            Self {
                cache_policy: CachePolicy::cache_first(ttl),
                retry_policy: RetryPolicy::none(),
            }
        }

        fn retried(max_attempts: u32) -> Self {
            Self {
                cache_policy: CachePolicy::Bypass,
                retry_policy: RetryPolicy::new(
                    max_attempts,
                    Backoff::Constant(Duration::ZERO),
                ),
            }
        }
    }

    impl Request for GetUsers {
        type Response = Vec<User>;
        type ErrorModel = ApiFault;

        fn descriptor(&self) -> Result<Descriptor, RequestError> {
            Descriptor::builder(Method::Get, "/users")
                .cache_policy(self.cache_policy)
                .retry_policy(self.retry_policy.clone())
                .build()
        }
    }

    struct CreateUser {
        retry_policy: RetryPolicy,
    }

    impl Request for CreateUser {
        type Response = User;
        type ErrorModel = ApiFault;

        fn descriptor(&self) -> Result<Descriptor, RequestError> {
            Descriptor::builder(Method::Post, "/users")
                .json_body(&serde_json::json!({"name": "ada"}))?
                .retry_policy(self.retry_policy.clone())
                .build()
        }
    }

    struct FetchReport {
        destination: Destination,
        cache_policy: CachePolicy,
    }

    impl DownloadRequest for FetchReport {
        type ErrorModel = ApiFault;

        fn descriptor(&self) -> Result<Descriptor, RequestError> {
            Descriptor::builder(Method::Get, "/report.bin")
                .cache_policy(self.cache_policy)
                .build()
        }

        fn destination(&self) -> Destination {
            self.destination.clone()
        }
    }

    fn base_url() -> Url {
        Url::parse("https://api.test").unwrap()
    }

    fn client_with(transport: Arc<MockTransport>) -> Client {
        Client::builder(base_url()).transport(transport).build()
    }

    async fn cached_client(transport: Arc<MockTransport>, dir: &TempDir) -> Client {
        let cache = DiskCache::new(dir.path().join("cache")).await.unwrap();
        Client::builder(base_url())
            .transport(transport)
            .cache(Arc::new(cache))
            .build()
    }

    #[tokio::test]
    async fn test_cache_first_second_call_skips_transport() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![ok(USERS_JSON), ok(USERS_JSON)]);
        let client = cached_client(Arc::clone(&transport), &dir).await;
        let request = GetUsers::cached(Duration::from_secs(60));

        let first = client.execute(&request).await.unwrap();
        let second = client.execute(&request).await.unwrap();

        assert_eq!(transport.calls(), 1, "second call must be served from cache");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cache_first_refetches_after_ttl() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![ok(USERS_JSON), ok(USERS_JSON)]);
        let client = cached_client(Arc::clone(&transport), &dir).await;
        let request = GetUsers::cached(Duration::from_millis(40));

        client.execute(&request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        client.execute(&request).await.unwrap();

        assert_eq!(transport.calls(), 2, "expired entry must refetch");
    }

    #[tokio::test]
    async fn test_cache_only_miss_never_touches_transport() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(Arc::clone(&transport));
        let request = GetUsers {
            cache_policy: CachePolicy::CacheOnly,
            retry_policy: RetryPolicy::none(),
        };

        let result = client.execute(&request).await;

        assert!(matches!(result, Err(Error::CacheMiss { .. })));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_on_post_fails_at_construction() {
        struct BadPost;
        impl Request for BadPost {
            type Response = User;
            type ErrorModel = ApiFault;
            fn descriptor(&self) -> Result<Descriptor, RequestError> {
                Descriptor::builder(Method::Post, "/users")
                    .cache_policy(CachePolicy::cache_first(Duration::from_secs(60)))
                    .build()
            }
        }

        let transport = MockTransport::new(vec![]);
        let client = client_with(Arc::clone(&transport));

        let result = client.execute(&BadPost).await;

        assert!(matches!(
            result,
            Err(Error::InvalidRequest(RequestError::CacheOnUnsafeMethod { .. }))
        ));
        assert_eq!(transport.calls(), 0, "validation must precede any I/O");
    }

    #[tokio::test]
    async fn test_post_503_is_never_retried() {
        let transport = MockTransport::new(vec![status(503)]);
        let client = client_with(Arc::clone(&transport));
        let request = CreateUser {
            retry_policy: RetryPolicy::new(3, Backoff::Constant(Duration::ZERO)),
        };

        let result = client.execute(&request).await;

        assert!(
            matches!(result, Err(Error::Server { status: 503, .. })),
            "POST must surface the server error, not retry exhaustion"
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_get_503_exhausts_into_retry_limit() {
        // A fourth attempt would succeed; the budget of 3 must stop first.
        let transport = MockTransport::new(vec![
            status(503),
            status(503),
            status(503),
            ok(USERS_JSON),
        ]);
        let client = client_with(Arc::clone(&transport));
        let request = GetUsers::retried(3);

        let result = client.execute(&request).await;

        assert!(matches!(
            result,
            Err(Error::RetryLimitExceeded { attempts: 3 })
        ));
        assert_eq!(transport.calls(), 3, "budget is 3 attempts, not 4");
    }

    #[tokio::test]
    async fn test_get_recovers_after_transient_network_failure() {
        let transport =
            MockTransport::new(vec![MockOutcome::NetworkFailure, ok(USERS_JSON)]);
        let client = client_with(Arc::clone(&transport));
        let request = GetUsers::retried(3);

        let users = client.execute(&request).await.unwrap();

        assert_eq!(users.len(), 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_4xx_decodes_declared_error_model() {
        let transport = MockTransport::new(vec![MockOutcome::Respond {
            status: 422,
            body: br#"{"code":"invalid_name"}"#.to_vec(),
        }]);
        let client = client_with(Arc::clone(&transport));
        let request = GetUsers::retried(3);

        let result = client.execute(&request).await;

        match result {
            Err(Error::Api { status, model }) => {
                assert_eq!(status, 422);
                assert_eq!(model.code, "invalid_name");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
        assert_eq!(transport.calls(), 1, "client errors are terminal");
    }

    #[tokio::test]
    async fn test_decode_failure_is_terminal_and_not_cached() {
        let dir = TempDir::new().unwrap();
        let transport =
            MockTransport::new(vec![ok(b"not json"), ok(USERS_JSON)]);
        let client = cached_client(Arc::clone(&transport), &dir).await;
        let request = GetUsers {
            cache_policy: CachePolicy::cache_first(Duration::from_secs(60)),
            retry_policy: RetryPolicy::with_max_attempts(3),
        };

        let first = client.execute(&request).await;
        assert!(matches!(first, Err(Error::Decode { .. })));
        assert_eq!(transport.calls(), 1, "decode failures must not retry");

        // Nothing was cached, so the next call reaches the transport.
        let second = client.execute(&request).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_request_level_values_win_over_client_defaults() {
        let transport = MockTransport::new(vec![ok(USERS_JSON)]);
        let client = Client::builder(base_url())
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .default_header("x-tenant", "default")
            .default_header("x-trace", "on")
            .default_query_param("page", "1")
            .build();

        struct Overriding;
        impl Request for Overriding {
            type Response = Vec<User>;
            type ErrorModel = ApiFault;
            fn descriptor(&self) -> Result<Descriptor, RequestError> {
                Descriptor::builder(Method::Get, "/users")
                    .header("x-tenant", "acme")
                    .query_param("filter", "active")
                    .build()
            }
        }

        client.execute(&Overriding).await.unwrap();

        let sent = transport.last_request();
        assert_eq!(sent.headers.get("x-tenant").map(String::as_str), Some("acme"));
        assert_eq!(sent.headers.get("x-trace").map(String::as_str), Some("on"));
        // Canonical key: merged query, sorted.
        assert_eq!(
            sent.url.as_str(),
            "https://api.test/users?filter=active&page=1"
        );
    }

    #[tokio::test]
    async fn test_canonical_key_has_no_query_marker_without_params() {
        let transport = MockTransport::new(vec![ok(USERS_JSON)]);
        let client = client_with(Arc::clone(&transport));

        client.execute(&GetUsers::plain()).await.unwrap();

        assert_eq!(transport.last_request().url.as_str(), "https://api.test/users");
    }

    struct TagHeader {
        value: &'static str,
    }

    #[async_trait]
    impl Middleware for TagHeader {
        async fn prepare(&self, mut request: WireRequest) -> WireRequest {
            let tag = match request.headers.get("x-chain") {
                Some(prior) => format!("{prior},{}", self.value),
                None => self.value.to_string(),
            };
            request.headers.insert("x-chain".to_string(), tag);
            request
        }
    }

    #[tokio::test]
    async fn test_middleware_prepare_runs_in_declared_order() {
        let transport = MockTransport::new(vec![ok(USERS_JSON)]);
        let client = Client::builder(base_url())
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .middleware(Arc::new(TagHeader { value: "first" }))
            .middleware(Arc::new(TagHeader { value: "second" }))
            .build();

        client.execute(&GetUsers::plain()).await.unwrap();

        assert_eq!(
            transport.last_request().headers.get("x-chain").map(String::as_str),
            Some("first,second")
        );
    }

    struct RejectAll;

    #[async_trait]
    impl Middleware for RejectAll {
        async fn process(
            &self,
            _response: ProcessedResponse,
        ) -> Result<ProcessedResponse, Rejection> {
            Err(Rejection::new("reject-all", RejectReason::Unauthenticated))
        }
    }

    struct MarkReached {
        reached: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Middleware for MarkReached {
        async fn process(
            &self,
            response: ProcessedResponse,
        ) -> Result<ProcessedResponse, Rejection> {
            self.reached.fetch_add(1, Ordering::SeqCst);
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_middleware_rejection_short_circuits_remaining_links() {
        let reached = Arc::new(AtomicUsize::new(0));
        let transport = MockTransport::new(vec![ok(USERS_JSON)]);
        let client = Client::builder(base_url())
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .middleware(Arc::new(RejectAll))
            .middleware(Arc::new(MarkReached {
                reached: Arc::clone(&reached),
            }))
            .build();

        let result = client.execute(&GetUsers::plain()).await;

        match result {
            Err(Error::Middleware(rejection)) => {
                assert_eq!(rejection.reason, RejectReason::Unauthenticated);
            }
            other => panic!("expected Middleware rejection, got {other:?}"),
        }
        assert_eq!(reached.load(Ordering::SeqCst), 0, "later links must not run");
    }

    #[tokio::test]
    async fn test_download_existing_destination_fails_before_transport() {
        let dir = TempDir::new().unwrap();
        let occupied = dir.path().join("report.bin");
        tokio::fs::write(&occupied, b"existing").await.unwrap();

        let transport = MockTransport::new(vec![]);
        let client = client_with(Arc::clone(&transport));
        let request = FetchReport {
            destination: Destination::new(&occupied),
            cache_policy: CachePolicy::Bypass,
        };

        let result = client.execute_download(&request).await;

        assert!(matches!(
            result,
            Err(Error::File(FileError::AlreadyExists { .. }))
        ));
        assert_eq!(transport.calls(), 0, "no transport work for a doomed download");
    }

    #[tokio::test]
    async fn test_download_places_file_and_verifies_checksum() {
        let dir = TempDir::new().unwrap();
        let body = b"report contents";
        let digest = format!("{:x}", sha2::Sha256::digest(body));

        let transport = MockTransport::new(vec![ok(body)]);
        let client = client_with(Arc::clone(&transport));
        let request = FetchReport {
            destination: Destination::new(dir.path().join("report.bin"))
                .checksum(Checksum::sha256(digest)),
            cache_policy: CachePolicy::Bypass,
        };

        let placed = client.execute_download(&request).await.unwrap();

        assert_eq!(tokio::fs::read(&placed).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_is_integrity_failure() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![ok(b"tampered contents")]);
        let client = client_with(Arc::clone(&transport));
        let request = FetchReport {
            destination: Destination::new(dir.path().join("report.bin"))
                .checksum(Checksum::sha256("00".repeat(32))),
            cache_policy: CachePolicy::Bypass,
        };

        let result = client.execute_download(&request).await;

        assert!(matches!(
            result,
            Err(Error::File(FileError::ChecksumMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_download_cache_first_serves_second_call_from_cache() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![ok(b"cached report"), ok(b"cached report")]);
        let client = cached_client(Arc::clone(&transport), &dir).await;

        let first = FetchReport {
            destination: Destination::new(dir.path().join("first.bin")),
            cache_policy: CachePolicy::cache_first(Duration::from_secs(60)),
        };
        let second = FetchReport {
            destination: Destination::new(dir.path().join("second.bin")),
            cache_policy: CachePolicy::cache_first(Duration::from_secs(60)),
        };

        let first_path = client.execute_download(&first).await.unwrap();
        let second_path = client.execute_download(&second).await.unwrap();

        assert_eq!(transport.calls(), 1, "second download must come from cache");
        assert_eq!(
            tokio::fs::read(&first_path).await.unwrap(),
            tokio::fs::read(&second_path).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_download_progress_is_monotone_and_finishes() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![ok(&vec![9u8; 4096])]);
        let client = client_with(Arc::clone(&transport));
        let request = FetchReport {
            destination: Destination::new(dir.path().join("report.bin")),
            cache_policy: CachePolicy::Bypass,
        };

        let mut stream = client.execute_download_with_progress(&request);
        let mut fractions = Vec::new();
        let mut finished = None;
        while let Some(event) = stream.next().await {
            match event {
                DownloadEvent::Progress(fraction) => fractions.push(fraction),
                DownloadEvent::Finished(result) => {
                    finished = Some(result);
                    break;
                }
            }
        }

        assert!(!fractions.is_empty(), "progress must be reported");
        assert!(
            fractions.windows(2).all(|pair| pair[0] <= pair[1]),
            "fractions must be non-decreasing: {fractions:?}"
        );
        assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
        let placed = finished.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&placed).await.unwrap(), vec![9u8; 4096]);
    }

    #[tokio::test]
    async fn test_download_4xx_decodes_error_model_from_spooled_body() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![MockOutcome::Respond {
            status: 404,
            body: br#"{"code":"gone"}"#.to_vec(),
        }]);
        let client = client_with(Arc::clone(&transport));
        let request = FetchReport {
            destination: Destination::new(dir.path().join("report.bin")),
            cache_policy: CachePolicy::Bypass,
        };

        let result = client.execute_download(&request).await;

        match result {
            Err(Error::Api { status: 404, model }) => assert_eq!(model.code, "gone"),
            other => panic!("expected Api error, got {other:?}"),
        }
        assert!(
            !dir.path().join("report.bin").exists(),
            "failed attempt must not leave a file at the destination"
        );
    }

    #[tokio::test]
    async fn test_concurrent_executes_share_one_client() {
        let transport = MockTransport::new(vec![
            ok(USERS_JSON),
            ok(USERS_JSON),
            ok(USERS_JSON),
            ok(USERS_JSON),
        ]);
        let client = client_with(Arc::clone(&transport));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.execute(&GetUsers::plain()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(transport.calls(), 4);
    }
}
