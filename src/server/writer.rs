//! Response serialization and write scheduling.
//!
//! [`ResponseWriter`] decides message framing for a [`Response`] on a given
//! connection (`Content-Length`, chunked coding or close-delimited, plus the
//! `Date`, `Server`, `Connection` and `Keep-Alive` headers) and pushes the head
//! and body through a [`WriteBuffer`] that tracks partially written bytes.

use std::io;
use std::io::SeekFrom;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::error;

use crate::config::ServerConfig;
use crate::http::response::Segment;
use crate::http::{Body, Response, StatusCode, Version, date};

/// Bodies up to this size are coalesced with the head into one write.
const COALESCE_LIMIT: usize = 16 * 1024;

/// Read size used when copying file segments to the socket.
const FILE_CHUNK: usize = 64 * 1024;

/// Outgoing bytes plus the offset of the first byte not yet accepted by the socket.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    buf: BytesMut,
    offset: usize,
}

impl WriteBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes queued but not yet written.
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Writes until the buffer is empty, resuming after short writes.
    pub(crate) async fn flush<W: AsyncWrite + Unpin>(&mut self, io: &mut W) -> io::Result<()> {
        while self.remaining() > 0 {
            let n = io.write(&self.buf[self.offset..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.offset += n;
        }
        self.buf.clear();
        self.offset = 0;
        io.flush().await
    }
}

/// How a response is to be framed on the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Framing {
    pub version: Version,
    /// The request was `HEAD`; the body is dropped.
    pub head_request: bool,
    /// The connection may stay open after this response.
    pub keep_alive: bool,
    /// Requests this connection may still carry, for `Keep-Alive: max=`.
    pub requests_left: Option<usize>,
    /// A `101` whose socket is handed to an upgrade callback afterwards.
    pub upgrading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    Length,
    Chunked,
    CloseDelimited,
}

/// Serializes responses for one connection.
pub(crate) struct ResponseWriter<'a> {
    config: &'a ServerConfig,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(config: &'a ServerConfig) -> Self {
        Self { config }
    }

    /// Writes `response` completely.
    ///
    /// Returns whether the connection can be reused afterwards. An error after
    /// the head has gone out (e.g. a file that shrank) is logged and returned;
    /// the caller must drop the connection.
    pub(crate) async fn write<W: AsyncWrite + Unpin>(
        &self,
        io: &mut W,
        out: &mut WriteBuffer,
        mut response: Response,
        framing: Framing,
    ) -> io::Result<bool> {
        let body = response.take_body();
        let (mode, keep_alive) = self.prepare(&mut response, &body, framing);

        out.push(&response.encode_head(framing.version, self.config.auto_reason_phrase));

        match (mode, body) {
            (BodyMode::None, _) | (_, Body::Empty) => out.flush(io).await?,
            (_, Body::Full(bytes)) => {
                if bytes.len() <= COALESCE_LIMIT {
                    out.push(&bytes);
                    out.flush(io).await?;
                } else {
                    out.flush(io).await?;
                    io.write_all(&bytes).await?;
                    io.flush().await?;
                }
            }
            (_, Body::Segments(segments)) => {
                out.flush(io).await?;
                for segment in segments {
                    if let Err(e) = write_segment(io, &segment).await {
                        error!(error = %e, "failed to stream response body; aborting connection");
                        return Err(e);
                    }
                }
                io.flush().await?;
            }
            (mode, Body::Stream(mut rx)) => {
                out.flush(io).await?;
                while let Some(chunk) = rx.recv().await {
                    if chunk.is_empty() {
                        continue;
                    }
                    if mode == BodyMode::Chunked {
                        out.push(format!("{:x}\r\n", chunk.len()).as_bytes());
                        out.push(&chunk);
                        out.push(b"\r\n");
                        out.flush(io).await?;
                    } else {
                        io.write_all(&chunk).await?;
                        io.flush().await?;
                    }
                }
                if mode == BodyMode::Chunked {
                    out.push(b"0\r\n\r\n");
                    out.flush(io).await?;
                }
            }
        }

        Ok(keep_alive)
    }

    /// Writes an interim `100 Continue`.
    pub(crate) async fn write_continue<W: AsyncWrite + Unpin>(
        &self,
        io: &mut W,
        out: &mut WriteBuffer,
    ) -> io::Result<()> {
        out.push(b"HTTP/1.1 100 Continue\r\n\r\n");
        out.flush(io).await
    }

    // Fills in framing headers and returns the body mode and whether the
    // connection survives this response.
    fn prepare(&self, response: &mut Response, body: &Body, framing: Framing) -> (BodyMode, bool) {
        let status = response.status();
        let upgrading = framing.upgrading && status == StatusCode::SwitchingProtocols;
        let mut keep_alive = framing.keep_alive
            && !response.headers().has_token("connection", "close");

        let headers = response.headers_mut();
        if !headers.contains("date") {
            headers.insert("Date", date::now());
        }
        if !self.config.server_token.is_empty() && !headers.contains("server") {
            headers.insert("Server", self.config.server_token.as_str());
        }

        if upgrading {
            headers.remove("content-length");
            headers.remove("transfer-encoding");
            return (BodyMode::None, false);
        }

        let mode = if !status.allows_body() {
            if status != StatusCode::NotModified {
                headers.remove("content-length");
            }
            headers.remove("transfer-encoding");
            BodyMode::None
        } else {
            match body.len() {
                Some(0) if headers.contains("content-length") => {
                    // A HEAD answer that already states the representation length.
                    BodyMode::None
                }
                Some(len) => {
                    headers.remove("transfer-encoding");
                    headers.set("Content-Length", len.to_string());
                    BodyMode::Length
                }
                None => {
                    headers.remove("content-length");
                    if framing.version == Version::Http11 {
                        headers.set("Transfer-Encoding", "chunked");
                        BodyMode::Chunked
                    } else {
                        keep_alive = false;
                        BodyMode::CloseDelimited
                    }
                }
            }
        };

        if keep_alive {
            if framing.version == Version::Http10 {
                headers.set("Connection", "keep-alive");
            }
            let timeout = self.config.keep_alive_timeout.as_secs();
            let value = match framing.requests_left {
                Some(max) => format!("timeout={timeout}, max={max}"),
                None => format!("timeout={timeout}"),
            };
            headers.set("Keep-Alive", value);
        } else {
            headers.remove("keep-alive");
            headers.set("Connection", "close");
        }

        let mode = if framing.head_request { BodyMode::None } else { mode };
        (mode, keep_alive)
    }
}

async fn write_segment<W: AsyncWrite + Unpin>(io: &mut W, segment: &Segment) -> io::Result<()> {
    match segment {
        Segment::Bytes(bytes) => io.write_all(bytes).await,
        Segment::File { path, offset, len } => {
            let mut file = tokio::fs::File::open(path).await?;
            file.seek(SeekFrom::Start(*offset)).await?;

            let mut remaining = *len;
            let mut chunk = vec![0u8; FILE_CHUNK];
            while remaining > 0 {
                let want = usize::try_from(remaining).unwrap_or(FILE_CHUNK).min(FILE_CHUNK);
                let n = file.read(&mut chunk[..want]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} ended {remaining} bytes early", path.display()),
                    ));
                }
                io.write_all(&chunk[..n]).await?;
                remaining -= n as u64;
            }
            Ok(())
        }
    }
}
