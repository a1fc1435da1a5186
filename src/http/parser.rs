//! Incremental HTTP/1.x request parser.
//!
//! [`Parser`] is a push/pull state machine: bytes are pushed in with
//! [`feed`](Parser::feed) in whatever sizes the socket delivers them, and
//! [`next_event`](Parser::next_event) pulls out, in order, one
//! [`ParseEvent::Head`] per request (as soon as the header block is complete,
//! before any body bytes), zero or more [`ParseEvent::Body`] chunks, and a
//! [`ParseEvent::Complete`] carrying any chunked trailers. Pipelined requests
//! simply continue with the next `Head`.
//!
//! The request head is parsed with [`httparse`]; chunk sizes and trailers use
//! `httparse::parse_chunk_size` and `httparse::parse_headers`.
//!
//! ```text
//!   Head ──► FixedBody ─────────────────────────────┐
//!     │                                              ▼
//!     ├──► ChunkSize ──► ChunkData ──► ChunkEnd ──► Complete ──► Head
//!     │        ▲                          │          ▲
//!     │        └──────────────────────────┘          │
//!     │        └── size 0 ──► Trailers ──────────────┘
//!     └──────────────────────────────────────────────┘ (no body)
//! ```

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::request::RequestHead;
use super::{Headers, Method, StatusCode, Version};
use crate::config::HttpLimits;

/// Longest chunk-size line (including extensions) accepted.
const MAX_CHUNK_LINE: usize = 1024;

/// Errors that terminate parsing. Each maps to the status sent to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("request line exceeds {max} bytes")]
    StartLineTooLong { max: usize },

    #[error("header block exceeds {max} bytes")]
    HeadersTooLarge { max: usize },

    #[error("more than {max} header fields")]
    TooManyHeaders { max: usize },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingFraming,

    #[error("unsupported transfer coding: {0}")]
    UnsupportedTransferCoding(String),

    #[error("malformed chunked body")]
    InvalidChunk,

    #[error("request body exceeds maximum allowed size of {max} bytes")]
    BodyTooLarge { max: u64 },
}

impl ParseError {
    /// The response status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::StartLineTooLong { .. } => StatusCode::UriTooLong,
            Self::HeadersTooLarge { .. } | Self::TooManyHeaders { .. } => {
                StatusCode::RequestHeaderFieldsTooLarge
            }
            Self::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            Self::UnsupportedTransferCoding(_) => StatusCode::NotImplemented,
            Self::BodyTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::Malformed(_)
            | Self::InvalidContentLength
            | Self::ConflictingFraming
            | Self::InvalidChunk => StatusCode::BadRequest,
        }
    }
}

/// One step of request parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// The request line and headers of a new request.
    Head(RequestHead),
    /// A piece of the (de-chunked) body.
    Body(Bytes),
    /// The end of the current request, with trailers from a chunked body.
    Complete { trailers: Headers },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    Complete,
    Failed,
}

/// Resumable HTTP/1.x request parser.
///
/// # Examples
///
/// ```
/// use aerie::config::HttpLimits;
/// use aerie::http::parser::{ParseEvent, Parser};
///
/// let mut parser = Parser::new(HttpLimits::default());
/// parser.feed(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Le");
/// assert!(parser.next_event().unwrap().is_none());
///
/// parser.feed(b"ngth: 2\r\n\r\nhi");
/// assert!(matches!(parser.next_event().unwrap(), Some(ParseEvent::Head(_))));
/// assert!(matches!(parser.next_event().unwrap(), Some(ParseEvent::Body(b)) if &b[..] == b"hi"));
/// assert!(matches!(parser.next_event().unwrap(), Some(ParseEvent::Complete { .. })));
/// ```
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    state: State,
    limits: HttpLimits,
    body_received: u64,
}

impl Parser {
    /// Creates a parser enforcing `limits`.
    pub fn new(limits: HttpLimits) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: State::Head,
            limits,
            body_received: 0,
        }
    }

    /// Appends bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        if self.state != State::Failed {
            self.buf.extend_from_slice(data);
        }
    }

    /// Returns `true` while between requests with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head && self.buf.is_empty()
    }

    /// Returns `true` once an error has been reported; no further input is processed.
    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    /// Takes every buffered, not yet parsed byte. Used when the connection
    /// switches protocols after a request.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// Pulls the next event out of the buffered input.
    ///
    /// Returns `Ok(None)` when more input is needed.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] for malformed or oversized input. The parser
    /// then stays failed and yields `Ok(None)` forever.
    pub fn next_event(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        match self.step() {
            Err(err) => {
                self.state = State::Failed;
                self.buf.clear();
                Err(err)
            }
            ok => ok,
        }
    }

    fn step(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        match self.state {
            State::Head => self.parse_head(),
            State::FixedBody { remaining } => Ok(self.take_body(remaining).map(|(chunk, left)| {
                self.state = if left == 0 {
                    State::Complete
                } else {
                    State::FixedBody { remaining: left }
                };
                ParseEvent::Body(chunk)
            })),
            State::ChunkSize => {
                if !self.parse_chunk_size()? {
                    return Ok(None);
                }
                self.step()
            }
            State::ChunkData { remaining } => {
                Ok(self.take_body(remaining).map(|(chunk, left)| {
                    self.state = if left == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                    ParseEvent::Body(chunk)
                }))
            }
            State::ChunkEnd => {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(ParseError::InvalidChunk);
                }
                self.buf.advance(2);
                self.state = State::ChunkSize;
                self.step()
            }
            State::Trailers => self.parse_trailers(),
            State::Complete => {
                self.finish_message();
                Ok(Some(ParseEvent::Complete {
                    trailers: Headers::new(),
                }))
            }
            State::Failed => Ok(None),
        }
    }

    fn finish_message(&mut self) {
        self.state = State::Head;
        self.body_received = 0;
    }

    fn parse_head(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        // RFC 9112 §2.2: ignore empty lines preceding the request line.
        while self.buf.starts_with(b"\r\n") || self.buf.starts_with(b"\n") {
            let skip = if self.buf[0] == b'\r' { 2 } else { 1 };
            self.buf.advance(skip);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let max_line = self.limits.max_start_line;
        let line_len = match self.buf.iter().take(max_line + 1).position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None if self.buf.len() > max_line => {
                return Err(ParseError::StartLineTooLong { max: max_line });
            }
            None => return Ok(None),
        };
        if line_len > max_line + 1 {
            return Err(ParseError::StartLineTooLong { max: max_line });
        }

        let max_headers = self.limits.max_header_size;
        let mut slots = vec![httparse::EMPTY_HEADER; self.limits.max_headers];
        let mut raw = httparse::Request::new(&mut slots);
        let head_len = match raw.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if self.buf.len() - line_len > max_headers {
                    return Err(ParseError::HeadersTooLarge { max: max_headers });
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ParseError::TooManyHeaders {
                    max: self.limits.max_headers,
                });
            }
            Err(httparse::Error::Version) => return Err(ParseError::UnsupportedVersion),
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
        };
        if head_len - line_len > max_headers {
            return Err(ParseError::HeadersTooLarge { max: max_headers });
        }

        let method: Method = match raw.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(ParseError::Malformed("missing method".to_owned())),
        };
        let target = raw
            .path
            .ok_or_else(|| ParseError::Malformed("missing request target".to_owned()))?
            .to_owned();
        let version = Version::from_minor(raw.version.ok_or(ParseError::UnsupportedVersion)?);

        let mut headers = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            headers.insert(header.name, String::from_utf8_lossy(header.value).into_owned());
        }

        self.state = self.body_state(&headers, version)?;
        self.buf.advance(head_len);
        self.body_received = 0;

        Ok(Some(ParseEvent::Head(RequestHead {
            method,
            target,
            version,
            headers,
        })))
    }

    // Decides how the body is framed (RFC 9112 §6.3).
    fn body_state(&self, headers: &Headers, version: Version) -> Result<State, ParseError> {
        let has_te = headers.contains("transfer-encoding");
        let has_cl = headers.contains("content-length");

        if has_te {
            if has_cl {
                return Err(ParseError::ConflictingFraming);
            }
            if version == Version::Http10 {
                return Err(ParseError::Malformed(
                    "Transfer-Encoding in an HTTP/1.0 request".to_owned(),
                ));
            }
            let codings: Vec<&str> = headers.tokens("transfer-encoding").collect();
            return match codings.as_slice() {
                [coding] if coding.eq_ignore_ascii_case("chunked") => Ok(State::ChunkSize),
                _ => Err(ParseError::UnsupportedTransferCoding(codings.join(", "))),
            };
        }

        if has_cl {
            let mut length: Option<u64> = None;
            for value in headers.tokens("content-length") {
                if !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidContentLength);
                }
                let parsed: u64 = value.parse().map_err(|_| ParseError::InvalidContentLength)?;
                if length.is_some_and(|l| l != parsed) {
                    return Err(ParseError::InvalidContentLength);
                }
                length = Some(parsed);
            }
            let length = length.ok_or(ParseError::InvalidContentLength)?;
            if length > self.limits.max_body_size {
                return Err(ParseError::BodyTooLarge {
                    max: self.limits.max_body_size,
                });
            }
            if length > 0 {
                return Ok(State::FixedBody { remaining: length });
            }
        }

        Ok(State::Complete)
    }

    fn take_body(&mut self, remaining: u64) -> Option<(Bytes, u64)> {
        if self.buf.is_empty() {
            return None;
        }
        let n = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        let chunk = self.buf.split_to(n).freeze();
        self.body_received += n as u64;
        Some((chunk, remaining - n as u64))
    }

    // Returns `false` when more input is needed.
    fn parse_chunk_size(&mut self) -> Result<bool, ParseError> {
        match httparse::parse_chunk_size(&self.buf) {
            Ok(httparse::Status::Complete((consumed, size))) => {
                self.buf.advance(consumed);
                if size == 0 {
                    self.state = State::Trailers;
                } else {
                    if self.body_received.saturating_add(size) > self.limits.max_body_size {
                        return Err(ParseError::BodyTooLarge {
                            max: self.limits.max_body_size,
                        });
                    }
                    self.state = State::ChunkData { remaining: size };
                }
                Ok(true)
            }
            Ok(httparse::Status::Partial) => {
                if self.buf.len() > MAX_CHUNK_LINE {
                    return Err(ParseError::InvalidChunk);
                }
                Ok(false)
            }
            Err(_) => Err(ParseError::InvalidChunk),
        }
    }

    fn parse_trailers(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        if self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
            self.finish_message();
            return Ok(Some(ParseEvent::Complete {
                trailers: Headers::new(),
            }));
        }

        let max_headers = self.limits.max_header_size;
        let mut slots = vec![httparse::EMPTY_HEADER; self.limits.max_headers];
        match httparse::parse_headers(&self.buf, &mut slots) {
            Ok(httparse::Status::Complete((consumed, fields))) => {
                if consumed > max_headers {
                    return Err(ParseError::HeadersTooLarge { max: max_headers });
                }
                let trailers = fields
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                self.buf.advance(consumed);
                self.finish_message();
                Ok(Some(ParseEvent::Complete { trailers }))
            }
            Ok(httparse::Status::Partial) => {
                if self.buf.len() > max_headers {
                    return Err(ParseError::HeadersTooLarge { max: max_headers });
                }
                Ok(None)
            }
            Err(httparse::Error::TooManyHeaders) => Err(ParseError::TooManyHeaders {
                max: self.limits.max_headers,
            }),
            Err(e) => Err(ParseError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut Parser) -> Result<Vec<ParseEvent>, ParseError> {
        let mut events = Vec::new();
        while let Some(event) = parser.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    fn parse_all(raw: &[u8]) -> Result<Vec<ParseEvent>, ParseError> {
        let mut parser = Parser::new(HttpLimits::default());
        parser.feed(raw);
        drain(&mut parser)
    }

    // Body chunks may be split differently; compare with bodies concatenated.
    fn normalize(events: Vec<ParseEvent>) -> Vec<ParseEvent> {
        let mut out: Vec<ParseEvent> = Vec::new();
        for event in events {
            match (out.last_mut(), event) {
                (Some(ParseEvent::Body(prev)), ParseEvent::Body(next)) => {
                    let mut joined = BytesMut::from(&prev[..]);
                    joined.extend_from_slice(&next);
                    *prev = joined.freeze();
                }
                (_, event) => out.push(event),
            }
        }
        out
    }

    #[test]
    fn simple_get() {
        let events = parse_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParseEvent::Head(head) => {
                assert_eq!(head.method, Method::Get);
                assert_eq!(head.target, "/index.html");
                assert_eq!(head.version, Version::Http11);
                assert_eq!(head.headers.get("host"), Some("x"));
            }
            other => panic!("expected head, got {other:?}"),
        }
        assert!(matches!(events[1], ParseEvent::Complete { .. }));
    }

    #[test]
    fn pipelined_requests_in_one_read() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
                    POST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc\
                    GET /c HTTP/1.0\r\n\r\n";
        let events = parse_all(raw).unwrap();
        let targets: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Head(h) => Some(h.target.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["/a", "/b", "/c"]);
        assert!(events.contains(&ParseEvent::Body(Bytes::from_static(b"abc"))));
        let completes = events
            .iter()
            .filter(|e| matches!(e, ParseEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 3);
    }

    #[test]
    fn resumable_at_every_split_point() {
        let raw: &[u8] = b"\r\nPOST /up?x=1 HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                           5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Sum: 42\r\n\r\n\
                           GET / HTTP/1.1\r\nHost: y\r\n\r\n";
        let whole = normalize(parse_all(raw).unwrap());

        for split in 1..raw.len() {
            let mut parser = Parser::new(HttpLimits::default());
            let mut events = Vec::new();
            parser.feed(&raw[..split]);
            events.extend(drain(&mut parser).unwrap());
            parser.feed(&raw[split..]);
            events.extend(drain(&mut parser).unwrap());
            assert_eq!(normalize(events), whole, "split at {split}");
        }

        let mut parser = Parser::new(HttpLimits::default());
        let mut events = Vec::new();
        for byte in raw {
            parser.feed(std::slice::from_ref(byte));
            events.extend(drain(&mut parser).unwrap());
        }
        assert_eq!(normalize(events), whole);
    }

    #[test]
    fn chunked_body_with_trailers() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                    3\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n";
        let events = normalize(parse_all(raw).unwrap());
        assert_eq!(events[1], ParseEvent::Body(Bytes::from_static(b"abc")));
        match &events[2] {
            ParseEvent::Complete { trailers } => assert_eq!(trailers.get("x-checksum"), Some("1")),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_chunk_syntax() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let err = parse_all(raw).unwrap_err();
        assert_eq!(err, ParseError::InvalidChunk);
        assert_eq!(err.status(), StatusCode::BadRequest);

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXX";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::InvalidChunk);
    }

    #[test]
    fn rejects_obsolete_line_folding() {
        let raw = b"GET / HTTP/1.1\r\nX-Long: a\r\n  continued\r\n\r\n";
        let err = parse_all(raw).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = parse_all(b"GET / HTTP/2.0\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::HttpVersionNotSupported);
    }

    #[test]
    fn oversized_headers_are_431() {
        let limits = HttpLimits {
            max_header_size: 64,
            ..HttpLimits::default()
        };
        let mut parser = Parser::new(limits);
        parser.feed(b"GET / HTTP/1.1\r\nX-Big: ");
        parser.feed(&[b'a'; 100]);
        let err = parser.next_event().unwrap_err();
        assert_eq!(err.status(), StatusCode::RequestHeaderFieldsTooLarge);
        assert!(parser.is_failed());
        parser.feed(b"\r\n\r\n");
        assert_eq!(parser.next_event(), Ok(None));
    }

    #[test]
    fn long_request_line() {
        let limits = HttpLimits {
            max_start_line: 32,
            ..HttpLimits::default()
        };
        let mut parser = Parser::new(limits);
        parser.feed(b"GET /");
        parser.feed(&[b'a'; 40]);
        assert_eq!(
            parser.next_event().unwrap_err(),
            ParseError::StartLineTooLong { max: 32 }
        );
    }

    #[test]
    fn body_limits() {
        let limits = HttpLimits {
            max_body_size: 4,
            ..HttpLimits::default()
        };
        let mut parser = Parser::new(limits.clone());
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        let err = parser.next_event().unwrap_err();
        assert_eq!(err.status(), StatusCode::PayloadTooLarge);

        let mut parser = Parser::new(limits);
        parser.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\n");
        assert!(matches!(parser.next_event(), Ok(Some(ParseEvent::Head(_)))));
        assert!(matches!(parser.next_event(), Ok(Some(ParseEvent::Body(_)))));
        assert_eq!(
            parser.next_event().unwrap_err(),
            ParseError::BodyTooLarge { max: 4 }
        );
    }

    #[test]
    fn framing_conflicts() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::ConflictingFraming);

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::InvalidContentLength);

        let raw = b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::InvalidContentLength);

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n";
        assert_eq!(
            parse_all(raw).unwrap_err().status(),
            StatusCode::NotImplemented
        );
    }

    #[test]
    fn head_is_reported_before_body_arrives() {
        let mut parser = Parser::new(HttpLimits::default());
        parser.feed(b"PUT /f HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 10\r\n\r\n");
        assert!(matches!(parser.next_event(), Ok(Some(ParseEvent::Head(_)))));
        assert_eq!(parser.next_event(), Ok(None));
        assert!(!parser.is_idle());
    }

    #[test]
    fn take_remaining_after_head() {
        let mut parser = Parser::new(HttpLimits::default());
        parser.feed(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n\x81\x80");
        assert!(matches!(parser.next_event(), Ok(Some(ParseEvent::Head(_)))));
        assert!(matches!(parser.next_event(), Ok(Some(ParseEvent::Complete { .. }))));
        assert_eq!(&parser.take_remaining()[..], b"\x81\x80");
        assert!(parser.is_idle());
    }
}
