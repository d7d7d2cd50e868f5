pub mod local_backend;
pub mod retry;
pub mod s3_backend;

use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

use crate::config::StelaConfig;
use crate::error::StelaError;

pub use retry::RetryPolicy;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store failures fall into exactly three kinds; everything the pipeline
/// decides (retry, abort, surface) hangs off this split.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<StoreError> for StelaError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(key) => {
                StelaError::RemotePermanent(format!("object not found: {key}"))
            }
            StoreError::Transient(msg) => StelaError::RemoteTransient(msg),
            StoreError::Permanent(msg) => StelaError::RemotePermanent(msg),
        }
    }
}

/// One object in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
}

/// One page of a listing. `truncated` means another page follows; the
/// caller continues by passing the last key as `start_after`.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub truncated: bool,
}

/// Uniform put/get/list/delete over a pluggable backend.
///
/// Keys are `/`-separated paths. Listing is paginated and ordered by key;
/// callers that stop pulling pages stop the scan.
pub trait ObjectStore: Send + Sync {
    /// Write an object from a streaming reader. `size_hint` is the
    /// uncompressed input size and only steers the single-shot vs multipart
    /// decision; the actual object length is whatever the reader yields.
    /// Returns the backend's entity tag.
    fn put(&self, key: &str, reader: &mut dyn Read, size_hint: u64) -> StoreResult<String>;

    /// Open an object for reading from the beginning.
    fn get(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        self.get_from(key, 0)
    }

    /// Open an object for reading from a byte offset (range request).
    fn get_from(&self, key: &str, offset: u64) -> StoreResult<Box<dyn Read + Send>>;

    /// Fetch one page of keys under `prefix`, strictly after `start_after`.
    fn list_page(&self, prefix: &str, start_after: Option<&str>) -> StoreResult<ListPage>;

    /// Delete an object. Deleting a missing object succeeds.
    fn delete(&self, key: &str) -> StoreResult<()>;

    fn exists(&self, key: &str) -> StoreResult<bool>;
}

impl ObjectStore for Arc<dyn ObjectStore> {
    fn put(&self, key: &str, reader: &mut dyn Read, size_hint: u64) -> StoreResult<String> {
        (**self).put(key, reader, size_hint)
    }
    fn get(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        (**self).get(key)
    }
    fn get_from(&self, key: &str, offset: u64) -> StoreResult<Box<dyn Read + Send>> {
        (**self).get_from(key, offset)
    }
    fn list_page(&self, prefix: &str, start_after: Option<&str>) -> StoreResult<ListPage> {
        (**self).list_page(prefix, start_after)
    }
    fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key)
    }
    fn exists(&self, key: &str) -> StoreResult<bool> {
        (**self).exists(key)
    }
}

/// Lazy iterator over every object under a prefix, pulling pages on demand.
pub struct PrefixScan<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
    buffer: std::vec::IntoIter<ObjectMeta>,
    last_key: Option<String>,
    exhausted: bool,
    failed: bool,
}

impl<'a> PrefixScan<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            buffer: Vec::new().into_iter(),
            last_key: None,
            exhausted: false,
            failed: false,
        }
    }
}

impl Iterator for PrefixScan<'_> {
    type Item = StoreResult<ObjectMeta>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(obj) = self.buffer.next() {
                self.last_key = Some(obj.key.clone());
                return Some(Ok(obj));
            }
            if self.exhausted {
                return None;
            }
            match self
                .store
                .list_page(&self.prefix, self.last_key.as_deref())
            {
                Ok(page) => {
                    // An empty page ends the scan even if the backend
                    // claims more; anything else would spin in place.
                    if page.objects.is_empty() {
                        self.exhausted = true;
                        return None;
                    }
                    self.exhausted = !page.truncated;
                    self.buffer = page.objects.into_iter();
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Convenience over [`PrefixScan`].
pub fn scan_prefix<'a>(store: &'a dyn ObjectStore, prefix: &str) -> PrefixScan<'a> {
    PrefixScan::new(store, prefix)
}

/// Reader over a remote object that reopens the stream with a range
/// request when a read fails mid-flight.
pub struct RestartingReader<'a> {
    store: &'a dyn ObjectStore,
    key: String,
    inner: Option<Box<dyn Read + Send>>,
    offset: u64,
    restarts_left: u32,
}

impl<'a> RestartingReader<'a> {
    pub fn open(store: &'a dyn ObjectStore, key: &str, max_restarts: u32) -> StoreResult<Self> {
        let inner = store.get(key)?;
        Ok(Self {
            store,
            key: key.to_string(),
            inner: Some(inner),
            offset: 0,
            restarts_left: max_restarts,
        })
    }
}

impl Read for RestartingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let inner = match self.inner.as_mut() {
                Some(r) => r,
                None => {
                    let reopened = self.store.get_from(&self.key, self.offset).map_err(|e| {
                        std::io::Error::other(format!("reopen {}: {e}", self.key))
                    })?;
                    self.inner = Some(reopened);
                    self.inner.as_mut().unwrap()
                }
            };
            match inner.read(buf) {
                Ok(n) => {
                    self.offset += n as u64;
                    return Ok(n);
                }
                Err(e) if self.restarts_left > 0 => {
                    tracing::warn!(
                        key = %self.key,
                        offset = self.offset,
                        restarts_left = self.restarts_left,
                        "stream error, restarting via range request: {e}"
                    );
                    self.restarts_left -= 1;
                    self.inner = None;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parsed store URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStoreUrl {
    /// Local filesystem root, used for development and tests.
    Local { path: String },
    /// S3-compatible store: explicit endpoint, bucket, optional root.
    S3 {
        bucket: String,
        root: String,
        endpoint: String,
    },
}

/// Parse a store URL.
///
/// Supported formats:
/// - Bare path (`/backups`, `./relative`, `relative`) → `Local`
/// - `file:///backups` → `Local`
/// - `s3://endpoint[:port]/bucket[/root]` → `S3` over HTTPS
/// - `s3+http://endpoint[:port]/bucket[/root]` → `S3` over HTTP
pub fn parse_store_url(raw: &str) -> crate::error::Result<ParsedStoreUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StelaError::Config("store URL must not be empty".into()));
    }
    if !trimmed.contains("://") {
        return Ok(ParsedStoreUrl::Local {
            path: trimmed.to_string(),
        });
    }
    let url = Url::parse(trimmed)
        .map_err(|e| StelaError::Config(format!("invalid store URL '{trimmed}': {e}")))?;
    match url.scheme() {
        "file" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err(StelaError::Config("file:// URL has empty path".into()));
            }
            Ok(ParsedStoreUrl::Local { path })
        }
        "s3" | "s3+https" => parse_s3_url(&url, "https"),
        "s3+http" => parse_s3_url(&url, "http"),
        other => Err(StelaError::Config(format!(
            "unsupported store URL scheme: '{other}'"
        ))),
    }
}

fn parse_s3_url(url: &Url, endpoint_scheme: &str) -> crate::error::Result<ParsedStoreUrl> {
    let host = url
        .host_str()
        .ok_or_else(|| StelaError::Config("s3 URL is missing an endpoint host".into()))?;
    let port_suffix = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let endpoint = format!("{endpoint_scheme}://{host}{port_suffix}");
    let path = url.path().trim_start_matches('/');
    let (bucket, root) = path.split_once('/').unwrap_or((path, ""));
    if bucket.is_empty() {
        return Err(StelaError::Config(
            "s3 URL must include a bucket in the path (expected s3://endpoint/bucket[/root])"
                .into(),
        ));
    }
    Ok(ParsedStoreUrl::S3 {
        bucket: bucket.to_string(),
        root: root.to_string(),
        endpoint,
    })
}

/// Multipart tuning for backends that support it.
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Objects at or below this size go up in one request.
    pub threshold: u64,
    /// Minimum part size.
    pub min_part_size: u64,
    /// Hard cap on part count (S3 allows 10_000).
    pub max_parts: u64,
    /// Parts uploaded concurrently per object.
    pub part_concurrency: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            threshold: 64 * 1024 * 1024,
            min_part_size: 8 * 1024 * 1024,
            max_parts: 10_000,
            part_concurrency: 4,
        }
    }
}

impl MultipartConfig {
    /// Part size for an object of `size` bytes:
    /// `max(min_part_size, ceil(size / max_parts))`.
    pub fn part_size(&self, size: u64) -> u64 {
        let per_part = size.div_ceil(self.max_parts.max(1));
        per_part.max(self.min_part_size)
    }
}

/// Build an object store from configuration.
pub fn store_from_config(cfg: &StelaConfig) -> crate::error::Result<Box<dyn ObjectStore>> {
    match parse_store_url(&cfg.store.url)? {
        ParsedStoreUrl::Local { path } => {
            Ok(Box::new(local_backend::LocalStore::new(&path)?))
        }
        ParsedStoreUrl::S3 {
            bucket,
            root,
            endpoint,
        } => {
            let region = cfg.store.region.as_deref().unwrap_or("us-east-1");
            let access_key_id = cfg.store.access_key_id.as_deref().ok_or_else(|| {
                StelaError::Config("S3 store requires access_key_id".into())
            })?;
            let secret_access_key = cfg.store.secret_access_key.as_deref().ok_or_else(|| {
                StelaError::Config("S3 store requires secret_access_key".into())
            })?;
            Ok(Box::new(s3_backend::S3Store::new(
                &bucket,
                region,
                &root,
                &endpoint,
                access_key_id,
                secret_access_key,
                cfg.retry_policy(),
                cfg.multipart_config(),
            )?))
        }
    }
}
