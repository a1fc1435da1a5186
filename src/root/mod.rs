//! Static file responder.
//!
//! [`Root`] maps request paths onto a document root and serves what it finds
//! there: index files for directories, conditional requests (`If-Match`,
//! `If-None-Match`, `If-Modified-Since`, `If-Unmodified-Since`, `If-Range`)
//! and byte ranges, including `multipart/byteranges` for several ranges.
//!
//! Lookups go through a stat cache with a fixed TTL, and small files are kept
//! in memory alongside their stat. Paths that resolve to nothing are passed to
//! the next responder in the chain.
//!
//! ```rust,no_run
//! use aerie::config::RootConfig;
//! use aerie::responder::Chain;
//! use aerie::root::Root;
//!
//! # fn main() -> Result<(), aerie::root::RootError> {
//! let root = Root::new(RootConfig::new("./public"))?;
//! let chain = Chain::new().with(root);
//! # Ok(())
//! # }
//! ```

mod cache;
mod mime;
mod path;
mod range;

pub use cache::FileStat;
pub use mime::MimeTypes;
pub use path::{percent_decode, remove_dot_segments};
pub use range::{ByteRange, ByteRangeSet, RangeError};

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

use self::cache::{Lookup, StatCache, SWEEP_INTERVAL};
use crate::config::RootConfig;
use crate::http::response::Segment;
use crate::http::{date, Body, Headers, Method, Request, Response, StatusCode};
use crate::responder::{BoxFuture, Next, Responder};

const ALLOW: &str = "GET, HEAD, OPTIONS";

#[derive(Debug, Error)]
pub enum RootError {
    #[error("document root {path:?} is unusable: {source}")]
    DocumentRoot { path: PathBuf, source: io::Error },

    #[error("path escapes the document root")]
    Forbidden,

    #[error("malformed request path")]
    BadPath,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RootError {
    /// Status sent to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden => StatusCode::Forbidden,
            Self::BadPath => StatusCode::BadRequest,
            Self::DocumentRoot { .. } | Self::Io(_) => StatusCode::InternalServerError,
        }
    }
}

/// Serves files below a document root.
#[derive(Clone)]
pub struct Root {
    inner: Arc<Inner>,
}

struct Inner {
    config: RootConfig,
    root: PathBuf,
    mime: MimeTypes,
    cache: Mutex<StatCache>,
    boundary: String,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("root", &self.inner.root)
            .field("cached", &self.inner.cache.lock().len())
            .finish()
    }
}

impl Root {
    /// Opens the document root named by `config`.
    ///
    /// # Errors
    ///
    /// [`RootError::DocumentRoot`] when the root does not exist or is not a
    /// directory.
    pub fn new(config: RootConfig) -> Result<Self, RootError> {
        let unusable = |source| RootError::DocumentRoot {
            path: config.document_root.clone(),
            source,
        };
        let root = std::fs::canonicalize(&config.document_root).map_err(unusable)?;
        if !root.is_dir() {
            return Err(unusable(io::Error::other("not a directory")));
        }

        let mime = MimeTypes::new(
            &config.mime_types,
            &config.default_mime_type,
            &config.default_charset,
        );
        let cache = StatCache::new(
            config.cache_ttl,
            config.max_cache_entries,
            config.max_buffered_files,
        );
        let boundary = format!("{:032x}", rand::thread_rng().r#gen::<u128>());
        debug!(root = %root.display(), "document root opened");

        let inner = Arc::new(Inner {
            config,
            root,
            mime,
            cache: Mutex::new(cache),
            boundary,
        });
        // Outside a runtime the cache is only swept on lookups.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(sweep_periodically(Arc::downgrade(&inner)));
        }
        Ok(Self { inner })
    }

    /// The canonical document root.
    pub fn document_root(&self) -> &Path {
        &self.inner.root
    }

    /// Boundary used for `multipart/byteranges` bodies.
    pub fn boundary(&self) -> &str {
        &self.inner.boundary
    }

    /// Number of cached lookups, live or not yet swept.
    pub fn cached_entries(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Drops expired cache entries now. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.inner.cache.lock().sweep(Instant::now())
    }

    /// Resolves `request_path` to a servable file.
    ///
    /// Returns `Ok(None)` when nothing servable exists there.
    ///
    /// # Errors
    ///
    /// [`RootError::BadPath`] for undecodable paths, [`RootError::Forbidden`]
    /// when the file lies outside the document root and [`RootError::Io`]
    /// for other filesystem failures.
    pub async fn lookup(&self, request_path: &str) -> Result<Option<Arc<FileStat>>, RootError> {
        self.lookup_with(request_path, false).await
    }

    async fn lookup_with(&self, request_path: &str, bypass: bool) -> Result<Lookup, RootError> {
        let fs_path = path::resolve(&self.inner.root, request_path).ok_or(RootError::BadPath)?;

        {
            let now = Instant::now();
            let mut cache = self.inner.cache.lock();
            let evicted = cache.maybe_sweep(now);
            if evicted > 0 {
                trace!(evicted, "stat cache swept");
            }
            if !bypass {
                if let Some(hit) = cache.get(request_path, now) {
                    return Ok(hit);
                }
            }
        }

        let (lookup, slot) = self.stat(&fs_path).await?;
        self.inner
            .cache
            .lock()
            .insert(request_path.to_owned(), lookup.clone(), Instant::now());
        drop(slot);
        Ok(lookup)
    }

    /// The returned slot must outlive the cache insert of the lookup.
    async fn stat(&self, fs_path: &Path) -> Result<(Lookup, Option<BufferSlot<'_>>), RootError> {
        let Some((file, meta)) = self.probe(fs_path).await? else {
            return Ok((None, None));
        };

        let canonical = tokio::fs::canonicalize(&file).await.map_err(fs_error)?;
        if !canonical.starts_with(&self.inner.root) {
            return Err(RootError::Forbidden);
        }

        let config = &self.inner.config;
        let size = meta.len();
        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
        let inode = inode(&meta);
        let etag = etag(&canonical, mtime, size, config.etag_include_inode.then_some(inode));

        let slot = if size <= config.buffered_file_max_size {
            BufferSlot::reserve(&self.inner.cache)
        } else {
            None
        };
        let buffer = if slot.is_some() {
            Some(Bytes::from(tokio::fs::read(&canonical).await.map_err(fs_error)?))
        } else {
            None
        };

        let stat = Arc::new(FileStat {
            path: canonical,
            size,
            mtime,
            inode,
            etag,
            buffer,
        });
        Ok((Some(stat), slot))
    }

    /// Finds the regular file behind `fs_path`, probing index files for
    /// directories.
    async fn probe(&self, fs_path: &Path) -> Result<Option<(PathBuf, Metadata)>, RootError> {
        let meta = match tokio::fs::metadata(fs_path).await {
            Ok(meta) => meta,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(fs_error(e)),
        };
        if meta.is_file() {
            return Ok(Some((fs_path.to_path_buf(), meta)));
        }
        if meta.is_dir() {
            for index in &self.inner.config.index_files {
                let candidate = fs_path.join(index);
                match tokio::fs::metadata(&candidate).await {
                    Ok(meta) if meta.is_file() => return Ok(Some((candidate, meta))),
                    Ok(_) => {}
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Err(fs_error(e)),
                }
            }
        }
        Ok(None)
    }

    /// Answers `request`, or `None` to pass it on.
    async fn serve(&self, request: &Request) -> Option<Response> {
        let bypass = self.inner.config.debug
            && (request.headers().has_token("cache-control", "no-cache")
                || request.headers().has_token("pragma", "no-cache"));

        let stat = match self.lookup_with(request.path(), bypass).await {
            Ok(Some(stat)) => stat,
            Ok(None) => return None,
            Err(e) => {
                match &e {
                    RootError::Io(_) | RootError::DocumentRoot { .. } => {
                        error!(path = request.path(), error = %e, "file lookup failed")
                    }
                    _ => debug!(path = request.path(), error = %e, "request path rejected"),
                }
                return Some(Response::error(e.status()));
            }
        };

        let head = match request.method() {
            Method::Get => false,
            Method::Head => true,
            Method::Options => return Some(Response::new(StatusCode::Ok).header("Allow", ALLOW)),
            _ => return Some(Response::error(StatusCode::MethodNotAllowed).header("Allow", ALLOW)),
        };

        let honor_range = match evaluate(request.headers(), &stat) {
            Precondition::Failed => return Some(Response::error(StatusCode::PreconditionFailed)),
            Precondition::NotModified => {
                let mut response = Response::new(StatusCode::NotModified);
                self.cache_headers(&mut response, &stat);
                return Some(response);
            }
            Precondition::Proceed { honor_range } => honor_range,
        };

        let content_type = self.inner.mime.lookup(&stat.path);
        let range = request.header("range").filter(|_| honor_range && !head);

        let mut response = match range.map(|value| ByteRangeSet::parse(value, stat.size)) {
            None => self.full(&stat, content_type, head),
            Some(Err(e)) => {
                debug!(path = request.path(), error = %e, "range rejected");
                Response::error(StatusCode::RangeNotSatisfiable)
                    .header("Content-Range", format!("bytes */{}", stat.size))
            }
            Some(Ok(set)) => match set.ranges() {
                [single] => Response::new(StatusCode::PartialContent)
                    .header("Content-Type", content_type)
                    .header("Content-Range", single.content_range(stat.size))
                    .with_body(Body::Segments(vec![slice(&stat, *single)])),
                ranges => self.multipart(&stat, ranges, &content_type),
            },
        };

        response.add_header("Accept-Ranges", "bytes");
        if response.status() != StatusCode::RangeNotSatisfiable {
            self.cache_headers(&mut response, &stat);
        }
        Some(response)
    }

    fn full(&self, stat: &FileStat, content_type: String, head: bool) -> Response {
        let response = Response::new(StatusCode::Ok).header("Content-Type", content_type);
        if head {
            return response.header("Content-Length", stat.size.to_string());
        }
        let body = match (&stat.buffer, stat.size) {
            (_, 0) => Body::Empty,
            (Some(buffer), _) => Body::Full(buffer.clone()),
            (None, size) => Body::Segments(vec![Segment::File {
                path: stat.path.clone(),
                offset: 0,
                len: size,
            }]),
        };
        response.with_body(body)
    }

    fn multipart(&self, stat: &FileStat, ranges: &[ByteRange], content_type: &str) -> Response {
        let boundary = &self.inner.boundary;
        let mut segments = Vec::with_capacity(ranges.len() * 2 + 1);
        for (i, range) in ranges.iter().enumerate() {
            let part = format!(
                "{}--{}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
                if i == 0 { "" } else { "\r\n" },
                boundary,
                content_type,
                range.content_range(stat.size),
            );
            segments.push(Segment::Bytes(Bytes::from(part)));
            segments.push(slice(stat, *range));
        }
        segments.push(Segment::Bytes(Bytes::from(format!("\r\n--{boundary}--\r\n"))));

        Response::new(StatusCode::PartialContent)
            .header(
                "Content-Type",
                format!("multipart/byteranges; boundary={boundary}"),
            )
            .with_body(Body::Segments(segments))
    }

    fn cache_headers(&self, response: &mut Response, stat: &FileStat) {
        let config = &self.inner.config;
        let max_age = config.expires_period.as_secs();
        let cache_control = if config.use_aggressive_cache_headers {
            format!(
                "public, max-age={max_age}, post-check={}, pre-check={}",
                config.aggressive_post_check, config.aggressive_pre_check
            )
        } else {
            format!("public, max-age={max_age}")
        };

        response.add_header("ETag", stat.etag.clone());
        response.add_header("Last-Modified", date::format(stat.mtime));
        response.add_header("Cache-Control", cache_control);
        response.add_header("Expires", date::format(SystemTime::now() + config.expires_period));
    }
}

impl Responder for Root {
    fn respond(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let root = self.clone();
        Box::pin(async move {
            match root.serve(&request).await {
                Some(response) => response,
                None => next.run(request).await,
            }
        })
    }
}

/// A claim on one in-memory file slot, released on drop.
struct BufferSlot<'a> {
    cache: &'a Mutex<StatCache>,
}

impl<'a> BufferSlot<'a> {
    fn reserve(cache: &'a Mutex<StatCache>) -> Option<Self> {
        cache.lock().reserve_buffer().then_some(Self { cache })
    }
}

impl Drop for BufferSlot<'_> {
    fn drop(&mut self) {
        self.cache.lock().release_buffer();
    }
}

async fn sweep_periodically(inner: Weak<Inner>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let evicted = inner.cache.lock().sweep(Instant::now());
        if evicted > 0 {
            trace!(evicted, "stat cache swept");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precondition {
    Proceed { honor_range: bool },
    NotModified,
    Failed,
}

/// Evaluates conditional headers in RFC 9110 §13.2.2 order.
fn evaluate(headers: &Headers, stat: &FileStat) -> Precondition {
    let mtime = date::unix_seconds(stat.mtime);

    if let Some(value) = headers.get("if-match") {
        if !etag_matches(value, &stat.etag, false) {
            return Precondition::Failed;
        }
    }

    if let Some(value) = headers.get("if-none-match") {
        if etag_matches(value, &stat.etag, true) {
            return Precondition::NotModified;
        }
    } else if let Some(since) = headers.get("if-modified-since").and_then(date::parse) {
        if mtime <= date::unix_seconds(since) {
            return Precondition::NotModified;
        }
    }

    if let Some(since) = headers.get("if-unmodified-since").and_then(date::parse) {
        if mtime > date::unix_seconds(since) {
            return Precondition::Failed;
        }
    }

    let honor_range = match headers.get("if-range") {
        None => true,
        Some(value) => match date::parse(value) {
            Some(date) => mtime <= date::unix_seconds(date),
            None => value.trim() == stat.etag,
        },
    };
    Precondition::Proceed { honor_range }
}

fn etag_matches(list: &str, etag: &str, weak: bool) -> bool {
    if list.trim() == "*" {
        return true;
    }
    list.split(',').map(str::trim).any(|tag| {
        if weak {
            tag.trim_start_matches("W/") == etag.trim_start_matches("W/")
        } else {
            !tag.starts_with("W/") && tag == etag
        }
    })
}

fn etag(path: &Path, mtime: SystemTime, size: u64, inode: Option<u64>) -> String {
    let mut hasher = Md5::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    let mtime = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
    hasher.update(format!(":{}.{}:{}", mtime.as_secs(), mtime.subsec_nanos(), size));
    if let Some(inode) = inode {
        hasher.update(format!(":{inode}"));
    }
    format!("\"{:x}\"", hasher.finalize())
}

fn slice(stat: &FileStat, range: ByteRange) -> Segment {
    match &stat.buffer {
        Some(buffer) => Segment::Bytes(buffer.slice(range.start as usize..=range.end as usize)),
        None => Segment::File {
            path: stat.path.clone(),
            offset: range.start,
            len: range.len(),
        },
    }
}

fn is_missing(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

fn fs_error(e: io::Error) -> RootError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        RootError::Forbidden
    } else {
        RootError::Io(e)
    }
}

#[cfg(unix)]
fn inode(meta: &Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(meta)
}

#[cfg(not(unix))]
fn inode(_meta: &Metadata) -> u64 {
    0
}
