//! Local image store, HTTP fetch utilities and the image resolver for shopfeed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use shopfeed_core::{ImageResolution, ResolutionStatus, PLACEHOLDER_FILENAME};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopfeed-storage";

/// Smallest valid lossless WebP (1x1); written when the store has no placeholder yet.
const PLACEHOLDER_WEBP: &[u8] = &[
    0x52, 0x49, 0x46, 0x46, 0x1a, 0x00, 0x00, 0x00, 0x57, 0x45, 0x42, 0x50, 0x56, 0x50, 0x38,
    0x4c, 0x0d, 0x00, 0x00, 0x00, 0x2f, 0x00, 0x00, 0x00, 0x10, 0x07, 0x10, 0x11, 0x11, 0x88,
    0x88, 0xfe, 0x07, 0x00,
];

const TITLE_FRAGMENT_CHARS: usize = 30;
const DEFAULT_EXTENSION: &str = ".jpg";
const MAX_EXTENSION_CHARS: usize = 4;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Strips characters that are unsafe in file names and turns spaces into underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

/// Extension (with leading dot) taken from the URL path, `.jpg` when absent or implausible.
pub fn infer_extension(source_url: &str) -> String {
    let path = match reqwest::Url::parse(source_url) {
        Ok(url) => url.path().to_string(),
        Err(_) => source_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let file_name = path.rsplit('/').next().unwrap_or_default();
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.chars().count() <= MAX_EXTENSION_CHARS
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{ext}")
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// `<product_id>_<sanitized title, 30 chars max><ext>`.
pub fn image_filename(product_id: &str, title: &str, source_url: &str) -> String {
    let title: String = sanitize_filename(title)
        .chars()
        .take(TITLE_FRAGMENT_CHARS)
        .collect();
    format!(
        "{}_{}{}",
        sanitize_filename(product_id),
        title,
        infer_extension(source_url)
    )
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let name = format!(".{}.tmp", Uuid::new_v4());
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Write a whole file through a sibling temp file and rename it into place.
pub async fn write_file_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_path = temp_path_for(dest);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = match file.write_all(bytes).await {
        Ok(()) => file.flush().await,
        Err(err) => Err(err),
    };
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                dest.display()
            )
        });
    }
    Ok(())
}

/// Flat directory of product images, served under a web prefix of the public root.
#[derive(Debug, Clone)]
pub struct ImageStore {
    public_dir: PathBuf,
    web_prefix: String,
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(public_dir: impl Into<PathBuf>, web_prefix: &str) -> Self {
        let public_dir = public_dir.into();
        let web_prefix = format!("/{}", web_prefix.trim_matches('/'));
        let dir = public_dir.join(web_prefix.trim_start_matches('/'));
        Self {
            public_dir,
            web_prefix,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn local_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub fn web_path(&self, filename: &str) -> String {
        format!("{}/{}", self.web_prefix.trim_end_matches('/'), filename)
    }

    pub fn placeholder_web_path(&self) -> String {
        self.web_path(PLACEHOLDER_FILENAME)
    }

    /// Maps a recorded web path back onto the filesystem.
    pub fn path_for_web(&self, web_path: &str) -> PathBuf {
        self.public_dir.join(web_path.trim_start_matches('/'))
    }

    pub async fn is_cached(&self, filename: &str) -> bool {
        non_empty_file(&self.local_path(filename)).await
    }

    pub async fn web_path_exists(&self, web_path: &str) -> bool {
        !web_path.is_empty() && non_empty_file(&self.path_for_web(web_path)).await
    }

    pub async fn ensure_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating image directory {}", self.dir.display()))
    }

    /// Returns true when the placeholder had to be written.
    pub async fn ensure_placeholder(&self) -> anyhow::Result<bool> {
        self.ensure_dir().await?;
        if self.is_cached(PLACEHOLDER_FILENAME).await {
            return Ok(false);
        }
        write_file_atomic(&self.local_path(PLACEHOLDER_FILENAME), PLACEHOLDER_WEBP).await?;
        Ok(true)
    }
}

async fn non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
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

/// Only connection failures are retried; a timed-out request already spent its budget.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() && !err.is_timeout() {
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
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
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
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
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
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Listing pages tolerate any 2xx and retry throttling or server errors. Image downloads
/// accept only `200 OK` and retry nothing but connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Page,
    Image,
}

impl RequestKind {
    fn accepts(self, status: StatusCode) -> bool {
        match self {
            Self::Page => status.is_success(),
            Self::Image => status == StatusCode::OK,
        }
    }

    fn retries_status(self, status: StatusCode) -> bool {
        self == Self::Page && classify_status(status) == RetryDisposition::Retryable
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn send_with_retries(
        &self,
        url: &str,
        kind: RequestKind,
    ) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if kind.accepts(status) {
                        return Ok(resp);
                    }
                    if kind.retries_status(status) && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after connection failure");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        self.fetch_bytes_inner(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_bytes_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.send_with_retries(url, RequestKind::Page).await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// Streams the body into `dest`; on any failure no file is left behind.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        self.download_inner(url, dest)
            .instrument(info_span!("image_fetch", url, dest = %dest.display()))
            .await
    }

    async fn download_inner(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut resp = self.send_with_retries(url, RequestKind::Image).await?;
        let temp_path = temp_path_for(dest);
        match stream_body(&mut resp, &temp_path).await {
            Ok(0) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(FetchError::EmptyBody {
                    url: url.to_string(),
                })
            }
            Ok(written) => match fs::rename(&temp_path, dest).await {
                Ok(()) => Ok(written),
                Err(source) => {
                    let _ = fs::remove_file(&temp_path).await;
                    Err(FetchError::Write {
                        path: dest.to_path_buf(),
                        source,
                    })
                }
            },
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }
}

async fn stream_body(resp: &mut reqwest::Response, temp_path: &Path) -> Result<u64, FetchError> {
    let write_err = |source| FetchError::Write {
        path: temp_path.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(temp_path).await.map_err(write_err)?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_err)?;
    Ok(written)
}

/// Guarantees a usable local image for every request: cache hit, fresh fetch, or placeholder.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    store: ImageStore,
    http: Arc<HttpFetcher>,
}

impl ImageResolver {
    pub fn new(store: ImageStore, http: Arc<HttpFetcher>) -> Self {
        Self { store, http }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn placeholder(&self) -> ImageResolution {
        ImageResolution::placeholder(self.store.placeholder_web_path())
    }

    pub async fn resolve(&self, source_url: Option<&str>, filename: &str) -> ImageResolution {
        let Some(url) = source_url.map(str::trim).filter(|u| !u.is_empty()) else {
            return self.placeholder();
        };
        if filename.is_empty() {
            warn!(url, "empty target filename; using placeholder");
            return self.placeholder();
        }

        if self.store.is_cached(filename).await {
            debug!(filename, "image cache hit");
            return ImageResolution {
                local_filename: filename.to_string(),
                local_path: self.store.web_path(filename),
                status: ResolutionStatus::Cached,
            };
        }

        match self.http.download_to(url, &self.store.local_path(filename)).await {
            Ok(bytes) => {
                debug!(filename, bytes, "image fetched");
                ImageResolution {
                    local_filename: filename.to_string(),
                    local_path: self.store.web_path(filename),
                    status: ResolutionStatus::Fetched,
                }
            }
            Err(err) => {
                warn!(url, filename, error = %err, "image fetch failed; using placeholder");
                self.placeholder()
            }
        }
    }
}
