//! HTTP/1.x request representation.
//!
//! A [`Request`] is assembled by the connection pipeline from the head and
//! body events emitted by [`Parser`](super::parser::Parser). Every request on a
//! connection carries a monotonically increasing [`id`](Request::id), which is
//! the key the pipeline uses to write responses back in arrival order.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::{Headers, Method, Version};

/// The parsed request line and header block, available before the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// The request-target exactly as sent.
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

/// A fully received HTTP request.
///
/// # Examples
///
/// ```
/// use aerie::http::{Method, Request};
///
/// let request = Request::builder(Method::Get, "http://example.com:8080/hello?name=world")
///     .header("Host", "ignored.example")
///     .build();
///
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.authority(), Some("example.com:8080"));
/// assert_eq!(request.query_param("name"), Some("world"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: u64,
    method: Method,
    target: String,
    authority: Option<String>,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    trailers: Headers,
    body: Bytes,
    params: HashMap<String, String>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl Request {
    /// Builds a request from a parsed head. The body and trailers are attached
    /// later with [`set_body`](Self::set_body) / [`set_trailers`](Self::set_trailers).
    pub fn from_head(id: u64, head: RequestHead) -> Self {
        let (authority, path, query) = split_target(&head.target);
        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            id,
            method: head.method,
            target: head.target,
            authority,
            path,
            query,
            version: head.version,
            headers: head.headers,
            trailers: Headers::new(),
            body: Bytes::new(),
            params,
            peer_addr: None,
            local_addr: None,
        }
    }

    /// Starts a [`RequestBuilder`] for tests and synthetic requests.
    pub fn builder(method: Method, target: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            head: RequestHead {
                method,
                target: target.into(),
                version: Version::Http11,
                headers: Headers::new(),
            },
            body: Bytes::new(),
            id: 1,
        }
    }

    /// Per-connection sequence number, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request-target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Authority from an absolute-form target (`http://host:port/...`), if any.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Returns the request path (without the query string). `*` for `OPTIONS *`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Shorthand for `self.headers().get(name)`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Trailer fields received after a chunked body.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Address of the client, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address the request arrived on, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn set_trailers(&mut self, trailers: Headers) {
        self.trailers = trailers;
    }

    pub(crate) fn set_addrs(&mut self, peer: Option<SocketAddr>, local: Option<SocketAddr>) {
        self.peer_addr = peer;
        self.local_addr = local;
    }

    /// Returns `true` if the client wants the connection kept open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present.
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is present.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// Returns `true` for `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Returns `true` if the request asks for a protocol upgrade to `protocol`.
    pub fn is_upgrade_to(&self, protocol: &str) -> bool {
        self.headers.has_token("connection", "upgrade")
            && self.headers.has_token("upgrade", protocol)
    }

    /// Returns the value of the `Content-Length` header parsed as a `u64`, if present.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

/// Fluent constructor for [`Request`] values outside the parser.
pub struct RequestBuilder {
    head: RequestHead,
    body: Bytes,
    id: u64,
}

impl RequestBuilder {
    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.head.headers.insert(name, value);
        self
    }

    /// Sets the protocol version (default HTTP/1.1).
    #[must_use]
    pub fn version(mut self, version: Version) -> Self {
        self.head.version = version;
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the request id (default 1).
    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Finishes the request.
    pub fn build(self) -> Request {
        let mut request = Request::from_head(self.id, self.head);
        request.set_body(self.body);
        request
    }
}

// Splits a request-target into (authority, path, query).
fn split_target(target: &str) -> (Option<String>, String, Option<String>) {
    if target == "*" {
        return (None, "*".to_owned(), None);
    }

    let (authority, rest) = match target.split_once("://") {
        Some((_scheme, after)) => {
            let end = after.find(['/', '?']).unwrap_or(after.len());
            (Some(after[..end].to_owned()), &after[end..])
        }
        None => (None, target),
    };

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (rest, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    (authority, path.to_owned(), query)
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// Keys and values have `+` decoded as a space; percent-escapes are kept.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.replace('+', " ");
            let value = parts.next().unwrap_or("").replace('+', " ");
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(target: &str) -> RequestBuilder {
        Request::builder(Method::Get, target)
    }

    #[test]
    fn origin_form() {
        let req = get("/search?q=rust+lang&page=2").build();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.authority(), None);
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
    }

    #[test]
    fn absolute_form_without_path() {
        let req = get("http://example.com?x=1").build();
        assert_eq!(req.authority(), Some("example.com"));
        assert_eq!(req.path(), "/");
        assert_eq!(req.query_param("x"), Some("1"));
    }

    #[test]
    fn asterisk_form() {
        let req = Request::builder(Method::Options, "*").build();
        assert_eq!(req.path(), "*");
    }

    #[test]
    fn keep_alive_defaults() {
        assert!(get("/").build().is_keep_alive());
        assert!(!get("/").header("Connection", "close").build().is_keep_alive());
        assert!(!get("/").version(Version::Http10).build().is_keep_alive());
        assert!(
            get("/")
                .version(Version::Http10)
                .header("Connection", "Keep-Alive")
                .build()
                .is_keep_alive()
        );
    }

    #[test]
    fn expect_and_upgrade() {
        let req = get("/")
            .header("Expect", "100-Continue")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .build();
        assert!(req.expects_continue());
        assert!(req.is_upgrade_to("websocket"));
        assert!(!req.is_upgrade_to("h2c"));
    }

    #[test]
    fn content_length() {
        let req = Request::builder(Method::Post, "/")
            .header("Content-Length", "5")
            .body("hello")
            .build();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&req.body()[..], b"hello");
    }
}
