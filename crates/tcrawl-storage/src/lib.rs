//! Raw page cache + HTTP transport for tracker-crawl.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tcrawl_core::{BodyKind, RawBody};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcrawl-storage";

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    /// The file already existed, so nothing was written.
    pub reused: bool,
}

/// Write-once cache of raw tracker documents under `<project>/raw`.
///
/// A cached file is never revalidated: if it exists it is returned as-is.
#[derive(Debug, Clone)]
pub struct PageCache {
    root: PathBuf,
}

impl PageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_path(&self, prefix: &str, index: usize, kind: BodyKind) -> PathBuf {
        self.root
            .join(format!("{prefix}_{index}.{}", kind.extension()))
    }

    pub fn detail_path(&self, prefix: &str, key: &str, kind: BodyKind) -> PathBuf {
        let key = sanitize_file_component(key);
        self.root
            .join("detail")
            .join(format!("{prefix}_{key}.{}", kind.extension()))
    }

    /// Returns the cached body at `path`, or `None` when nothing is cached yet.
    /// A file that exists but does not decode is [`CacheError::Corrupt`].
    pub async fn load(&self, path: &Path, kind: BodyKind) -> Result<Option<RawBody>, CacheError> {
        let io_error = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        if !fs::try_exists(path).await.map_err(io_error)? {
            return Ok(None);
        }
        let bytes = fs::read(path).await.map_err(io_error)?;
        decode_body(&bytes, kind)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                path: path.to_path_buf(),
                message: format!("{e:#}"),
            })
    }

    pub async fn store(&self, path: &Path, body: &RawBody) -> anyhow::Result<StoredPage> {
        let bytes = encode_body(body)?;
        write_atomic(path, &bytes).await
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("reading cached file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cached file {} is unreadable: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
}

pub fn decode_body(bytes: &[u8], kind: BodyKind) -> anyhow::Result<RawBody> {
    match kind {
        BodyKind::Json => serde_json::from_slice(bytes)
            .map(RawBody::Json)
            .context("parsing JSON body"),
        BodyKind::Csv | BodyKind::Html => String::from_utf8(bytes.to_vec())
            .map(RawBody::Text)
            .context("body is not valid UTF-8"),
    }
}

/// JSON bodies are written with four-space indentation.
pub fn encode_body(body: &RawBody) -> anyhow::Result<Vec<u8>> {
    match body {
        RawBody::Json(value) => to_json_pretty(value),
        RawBody::Text(text) => Ok(text.as_bytes().to_vec()),
    }
}

pub fn to_json_pretty<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .context("serializing JSON")?;
    Ok(out)
}

fn sanitize_file_component(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Write `bytes` to `path` via a temp file and rename. An existing file is
/// left untouched and reported as reused.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredPage> {
    let content_hash = PageCache::sha256_hex(bytes);
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking path {}", path.display()))?
    {
        return Ok(StoredPage {
            content_hash,
            path: path.to_path_buf(),
            byte_size: bytes.len(),
            reused: true,
        });
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    let reused = publish_no_clobber(&temp_path, path).await?;
    Ok(StoredPage {
        content_hash,
        path: path.to_path_buf(),
        byte_size: bytes.len(),
        reused,
    })
}

/// Links a fully written temp file into place without replacing an existing
/// target, then drops the temp name. Returns `true` when another writer got
/// there first.
async fn publish_no_clobber(temp_path: &Path, path: &Path) -> anyhow::Result<bool> {
    let linked = fs::hard_link(temp_path, path).await;
    let _ = fs::remove_file(temp_path).await;
    match linked {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(true),
        Err(err) => Err(err).with_context(|| {
            format!("linking {} -> {}", temp_path.display(), path.display())
        }),
    }
}

/// Like [`write_atomic`] but replaces an existing file. Used for the final
/// outputs, which are rebuilt on every run.
pub async fn replace_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredPage> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(StoredPage {
        content_hash: PageCache::sha256_hex(bytes),
        path: path.to_path_buf(),
        byte_size: bytes.len(),
        reused: false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// A GET request against a tracker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub accept: Option<&'static str>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            accept: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn accept_json(mut self) -> Self {
        self.accept = Some("application/json");
        self
    }

    /// `url?k=v&...` without percent-encoding; for logs and test lookups.
    pub fn describe(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.url, query)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Outbound HTTP seam. [`HttpFetcher`] is the real implementation; tests
/// substitute an in-memory one.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        if let Some(accept) = request.accept {
            builder = builder.header(ACCEPT, accept);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// Every attempt, retries included, waits for the token bucket first.
    async fn fetch_with_retries(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(err)
                    if attempt < self.backoff.max_retries
                        && err.disposition() == RetryDisposition::Retryable =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, delay_secs = delay.as_secs_f64(), "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = debug_span!("http_fetch", url = %request.describe());
        self.fetch_with_retries(request).instrument(span).await
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::{FetchError, FetchedResponse, HttpRequest, Transport};

    /// In-memory [`Transport`] keyed by [`HttpRequest::describe`]. Unknown
    /// requests answer 404.
    #[derive(Debug, Default)]
    pub struct StaticTransport {
        responses: HashMap<String, Result<Vec<u8>, u16>>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_body(mut self, request: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
            self.responses.insert(request.into(), Ok(body.into()));
            self
        }

        pub fn with_status(mut self, request: impl Into<String>, status: u16) -> Self {
            self.responses.insert(request.into(), Err(status));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn get(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
            let key = request.describe();
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(key.clone());
            }
            match self.responses.get(&key) {
                Some(Ok(body)) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: key,
                    body: body.clone(),
                }),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: key,
                }),
                None => Err(FetchError::HttpStatus { status: 404, url: key }),
            }
        }
    }
}
