//! HTTP/1.x response builder.
//!
//! A [`Response`] carries a status, an optional custom reason phrase, headers
//! and a [`Body`]. Message framing (`Content-Length`, chunked coding,
//! `Connection`, `Date`) is decided by the connection pipeline when the
//! response is written, so handlers only describe content.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use super::{Headers, StatusCode, Version};
use crate::server::Upgraded;

/// Callback that takes over the socket after a `101 Switching Protocols`
/// response has been flushed.
pub type UpgradeHandler =
    Box<dyn FnOnce(Upgraded) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static>;

/// One piece of a [`Body::Segments`] body.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Bytes held in memory.
    Bytes(Bytes),
    /// `len` bytes of the file at `path`, starting at `offset`, read while writing.
    File { path: PathBuf, offset: u64, len: u64 },
}

impl Segment {
    /// Number of bytes this segment contributes to the body.
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    /// Returns `true` for zero-length segments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response body.
pub enum Body {
    /// No body.
    Empty,
    /// A body held in memory.
    Full(Bytes),
    /// A body of known length assembled from memory and file segments.
    Segments(Vec<Segment>),
    /// A body of unknown length produced by a [`BodySender`].
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    /// Creates a streaming body and the sender that feeds it. Dropping the
    /// sender ends the body.
    pub fn channel(buffer: usize) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (BodySender { tx }, Body::Stream(rx))
    }

    /// Body length, or `None` for streams.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Full(b) => Some(b.len() as u64),
            Self::Segments(segments) => Some(segments.iter().map(Segment::len).sum()),
            Self::Stream(_) => None,
        }
    }

    /// Returns `true` when the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            Self::Segments(s) => f.debug_tuple("Segments").field(s).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Producer side of a [`Body::Stream`].
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
}

impl BodySender {
    /// Sends one chunk. Returns `false` once the connection has gone away.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> bool {
        self.tx.send(chunk.into()).await.is_ok()
    }
}

/// An HTTP response, ready to be handed to the connection pipeline.
///
/// # Examples
///
/// ```
/// use aerie::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.body_len(), Some(15));
/// ```
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: Headers,
    body: Body,
    upgrade: Option<UpgradeHandler>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
            body: Body::Empty,
            upgrade: None,
        }
    }

    /// Creates a minimal HTML error page for `status`.
    pub fn error(status: StatusCode) -> Self {
        let html = format!(
            "<html><body><h1>{} {}</h1></body></html>",
            status.as_u16(),
            status.canonical_reason()
        );
        Self::new(status)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(html)
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place, for responders decorating a downstream response.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a custom reason phrase instead of the canonical one.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets any [`Body`] variant.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Adds `Connection: close` when `keep_alive` is `false`.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        if !keep_alive {
            self.headers.set("Connection", "close");
        }
        self
    }

    /// Registers the callback that receives the socket after a `101` response
    /// has been written.
    #[must_use]
    pub fn on_upgrade<F, Fut>(mut self, handler: F) -> Self
    where
        F: FnOnce(Upgraded) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.upgrade = Some(Box::new(
            move |io: Upgraded| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(handler(io))
            },
        ));
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Replaces the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the custom reason phrase, if one was set.
    pub fn custom_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Length of the body, or `None` when it is streamed.
    pub fn body_len(&self) -> Option<u64> {
        self.body.len()
    }

    /// Replaces the body with [`Body::Empty`] and returns the old one.
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// Removes the upgrade callback, if any.
    pub fn take_upgrade(&mut self) -> Option<UpgradeHandler> {
        self.upgrade.take()
    }

    /// Returns `true` if an upgrade callback is registered.
    pub fn has_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Serializes the status line and header block, including the blank line.
    ///
    /// An empty custom reason is replaced by the canonical phrase when
    /// `auto_reason` is set.
    pub fn encode_head(&self, version: Version, auto_reason: bool) -> Bytes {
        let reason = match self.reason.as_deref() {
            Some(r) if !r.is_empty() || !auto_reason => r,
            _ => self.status.canonical_reason(),
        };

        let mut buf = BytesMut::with_capacity(64 + self.headers.len() * 48);
        buf.put(format!("{} {} {}\r\n", version, self.status.as_u16(), reason).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.put(name.as_bytes());
            buf.put(&b": "[..]);
            buf.put(value.as_bytes());
            buf.put(&b"\r\n"[..]);
        }
        buf.put(&b"\r\n"[..]);
        buf.freeze()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(r: &Response) -> String {
        String::from_utf8(r.encode_head(Version::Http11, true).to_vec()).unwrap()
    }

    #[test]
    fn status_line_and_headers() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        let s = head(&r);
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("X-Request-Id: abc-123\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn custom_and_empty_reason() {
        let r = Response::new(StatusCode::NotFound).reason("Nope");
        assert!(head(&r).starts_with("HTTP/1.1 404 Nope\r\n"));

        let r = Response::new(StatusCode::NotFound).reason("");
        assert!(head(&r).starts_with("HTTP/1.1 404 Not Found\r\n"));

        let r = Response::new(StatusCode::NotFound).reason("");
        let raw = r.encode_head(Version::Http10, false);
        assert!(raw.starts_with(b"HTTP/1.0 404 \r\n"));
    }

    #[test]
    fn error_page() {
        let r = Response::error(StatusCode::RequestHeaderFieldsTooLarge);
        match r.body_ref() {
            Body::Full(b) => assert_eq!(
                &b[..],
                b"<html><body><h1>431 Request Header Fields Too Large</h1></body></html>"
            ),
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(r.headers().get("content-type"), Some("text/html; charset=utf-8"));
    }

    #[test]
    fn segment_lengths() {
        let body = Body::Segments(vec![
            Segment::Bytes(Bytes::from_static(b"--b\r\n")),
            Segment::File { path: PathBuf::from("x"), offset: 10, len: 20 },
        ]);
        assert_eq!(body.len(), Some(25));
    }

    #[test]
    fn keep_alive_false_sets_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        assert_eq!(r.headers().get("connection"), Some("close"));
    }
}
