//! reqwest-backed [`Transport`] implementation.
//!
//! The client is built once and reused across exchanges, taking advantage
//! of connection pooling. Redirect handling, TLS, and pooling policy all
//! live here, behind the trait.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_LENGTH;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::{ProgressObserver, RawResponse, TempDownload, Transport, TransportError, WireRequest};
use crate::request::Method;

/// Default connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout in seconds (generous, downloads can be large).
const READ_TIMEOUT_SECS: u64 = 300;

/// HTTP transport over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    spool_dir: Option<PathBuf>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates a transport with default timeouts (30s connect, 5min read).
    ///
    /// # Panics
    ///
    /// Panics if the client builder fails with the static configuration.
    /// This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a transport with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the client builder fails with the supplied configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self {
            client,
            spool_dir: None,
        }
    }

    /// Directory where download spool files are created. Defaults to the
    /// system temp directory; set this to the destination filesystem to
    /// keep finalization a pure rename.
    #[must_use]
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    fn build_request(&self, request: &WireRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }

    async fn exchange(&self, request: &WireRequest) -> Result<reqwest::Response, TransportError> {
        let url = request.url.to_string();
        self.build_request(request).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::timeout(&url)
            } else {
                TransportError::network(&url, e)
            }
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(level = "debug", skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn send(&self, request: WireRequest) -> Result<(Vec<u8>, RawResponse), TransportError> {
        let url = request.url.to_string();
        let response = self.exchange(&request).await?;
        let raw = raw_from(&response);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(&url, e))?
            .to_vec();
        debug!(status = raw.status, bytes = bytes.len(), "exchange complete");
        Ok((bytes, raw))
    }

    #[instrument(level = "debug", skip(self, request, progress), fields(url = %request.url))]
    async fn send_download(
        &self,
        request: WireRequest,
        progress: Option<ProgressObserver>,
    ) -> Result<(TempDownload, RawResponse), TransportError> {
        let url = request.url.to_string();
        let response = self.exchange(&request).await?;
        let raw = raw_from(&response);
        let expected = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let spool_dir = self
            .spool_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let temp_path = tempfile::Builder::new()
            .prefix("courier-")
            .tempfile_in(&spool_dir)
            .map_err(|e| TransportError::io(&spool_dir, e))?
            .into_temp_path();

        let file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| TransportError::io(temp_path.to_path_buf(), e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::network(&url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransportError::io(temp_path.to_path_buf(), e))?;
            written += chunk.len() as u64;
            if let Some(observer) = &progress {
                observer(written, expected);
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| TransportError::io(temp_path.to_path_buf(), e))?;

        debug!(status = raw.status, bytes = written, "download spooled");
        Ok((TempDownload::new(temp_path), raw))
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn raw_from(response: &reqwest::Response) -> RawResponse {
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    RawResponse {
        status: response.status().as_u16(),
        headers,
        url: response.url().as_str().to_string(),
    }
}
