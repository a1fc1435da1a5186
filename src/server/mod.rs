//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and runs one [`pipeline`] task per socket. The
//! pipeline parses pipelined HTTP/1.x requests, dispatches them to the
//! responder chain of the matching virtual [`Host`], and writes responses back
//! strictly in request order. Connections are persistent by default.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::ServerConfig;

pub mod host;
pub mod pipeline;
mod writer;

pub use host::{Host, Hosts};
pub use pipeline::serve_connection;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Byte streams the server can drive: TCP sockets, TLS streams, in-memory pipes.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A connection handed over after `101 Switching Protocols`.
///
/// Reads first return any bytes the HTTP parser had already buffered past the
/// upgrade request, then continue from the socket.
pub struct Upgraded {
    io: Box<dyn Io>,
    read_buf: BytesMut,
}

impl Upgraded {
    /// Wraps `io`, replaying `read_buf` before new socket data.
    pub fn new(io: Box<dyn Io>, read_buf: BytesMut) -> Self {
        Self { io, read_buf }
    }

    /// Splits into the socket and the bytes read ahead of it.
    pub fn into_parts(self) -> (Box<dyn Io>, BytesMut) {
        (self.io, self.read_buf)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            let replay = self.read_buf.split_to(n);
            buf.put_slice(&replay);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// The HTTP server.
///
/// Binds to a TCP address and dispatches incoming requests to a set of
/// virtual [`Hosts`].
///
/// # Examples
///
/// ```rust,no_run
/// use aerie::http::{Request, Response, StatusCode};
/// use aerie::responder::Chain;
/// use aerie::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     let app = Chain::from(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     });
///     server.run(app).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the server to the given TCP address with the default [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(ServerConfig::default()),
        })
    }

    /// Replaces the connection settings.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the connection settings.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, hosts: impl Into<Hosts>) -> Result<(), ServerError> {
        self.run_until(hosts, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// accepted keep running on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<F>(self, hosts: impl Into<Hosts>, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let hosts = Arc::new(hosts.into());
        info!(address = %self.local_addr, hosts = hosts.len(), "aerie listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "aerie stopped accepting connections");
                    return Ok(());
                }
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
            }
            let local_addr = stream.local_addr().ok();
            let hosts = Arc::clone(&hosts);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                match serve_connection(stream, hosts, config, Some(peer_addr), local_addr).await {
                    Ok(()) => debug!(peer = %peer_addr, "connection closed"),
                    Err(e) => debug!(peer = %peer_addr, error = %e, "connection closed with error"),
                }
            });
        }
    }
}
