//! Per-connection request pipeline.
//!
//! One [`serve_connection`] call owns a socket for its whole life. It feeds
//! socket bytes to the incremental [`Parser`], gives every request a
//! sequential id, runs complete requests on their own tasks, and keeps an
//! ordered map from request id to response slot. Responses are written only
//! from the front of that map, so a fast handler for request N+1 waits for
//! the response to request N.
//!
//! The loop alternates between three phases:
//!
//! 1. pull every available parser event (bounded by `max_pipelined`),
//! 2. write every response that is ready at the front of the queue,
//! 3. wait for socket data, a finished handler, or the idle timer.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, warn};

use super::Io;
use super::Upgraded;
use super::host::Hosts;
use super::writer::{Framing, ResponseWriter, WriteBuffer};
use crate::config::ServerConfig;
use crate::http::parser::{ParseError, ParseEvent, Parser};
use crate::http::request::RequestHead;
use crate::http::response::UpgradeHandler;
use crate::http::{Headers, Method, Request, Response, StatusCode, Version};
use crate::responder::Chain;

const READ_CHUNK: usize = 16 * 1024;

/// Serves HTTP/1.x on `io` until the peer leaves, the connection is closed by
/// policy, or the socket is handed to an upgrade callback.
///
/// # Errors
///
/// Returns the I/O error that ended the connection. Pending handler results
/// are discarded.
pub async fn serve_connection<S: Io>(
    io: S,
    hosts: Arc<Hosts>,
    config: Arc<ServerConfig>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> io::Result<()> {
    ConnectionPipeline::new(io, hosts, config, peer_addr, local_addr)
        .run()
        .await
}

/// Response state for one request, keyed by request id.
struct Slot {
    version: Version,
    head_request: bool,
    keep_alive: bool,
    requests_left: Option<usize>,
    /// The whole request, body included, has been received.
    complete: bool,
    expects_continue: bool,
    continue_sent: bool,
    response: Option<Response>,
}

/// The request whose body is still being read.
struct Receiving {
    request: Request,
    body: BytesMut,
    /// `None` when the request was already answered by the pipeline itself.
    chain: Option<Chain>,
}

enum Flow {
    Continue,
    Close,
    Upgrade(UpgradeHandler),
}

enum Wake {
    Read(io::Result<usize>),
    Done(u64, Response),
    IdleTimeout,
}

struct ConnectionPipeline<S> {
    io: S,
    hosts: Arc<Hosts>,
    config: Arc<ServerConfig>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    parser: Parser,
    out: WriteBuffer,
    pending: BTreeMap<u64, Slot>,
    current: Option<Receiving>,
    next_id: u64,
    served: usize,
    done_tx: mpsc::UnboundedSender<(u64, Response)>,
    done_rx: mpsc::UnboundedReceiver<(u64, Response)>,
    /// The peer will send nothing more.
    read_closed: bool,
    /// No further requests are accepted on this connection.
    closing: bool,
    /// Parsing is held after an upgrade request until its response is written.
    upgrade_barrier: Option<u64>,
    last_activity: Instant,
}

impl<S: Io> ConnectionPipeline<S> {
    fn new(
        io: S,
        hosts: Arc<Hosts>,
        config: Arc<ServerConfig>,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            io,
            parser: Parser::new(config.limits.clone()),
            hosts,
            config,
            peer_addr,
            local_addr,
            out: WriteBuffer::default(),
            pending: BTreeMap::new(),
            current: None,
            next_id: 1,
            served: 0,
            done_tx,
            done_rx,
            read_closed: false,
            closing: false,
            upgrade_barrier: None,
            last_activity: Instant::now(),
        }
    }

    async fn run(mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            self.process_input();

            match self.write_ready().await? {
                Flow::Continue => {}
                Flow::Close => break,
                Flow::Upgrade(handler) => return self.upgrade(handler).await,
            }

            if (self.read_closed || self.closing) && self.pending.is_empty() {
                break;
            }

            let reading = self.wants_read();
            let idle = self.parser.is_idle() && self.pending.is_empty();
            let deadline = self.last_activity + self.config.keep_alive_timeout;

            let wake = tokio::select! {
                result = self.io.read(&mut chunk), if reading => Wake::Read(result),
                Some((id, response)) = self.done_rx.recv() => Wake::Done(id, response),
                () = sleep_until(deadline), if idle => Wake::IdleTimeout,
            };

            match wake {
                Wake::Read(Ok(0)) => {
                    debug!(peer = ?self.peer_addr, "peer closed its write side");
                    self.read_closed = true;
                    // A request cut off mid-message is never answered.
                    if let Some(current) = self.current.take() {
                        self.pending.remove(&current.request.id());
                    }
                }
                Wake::Read(Ok(n)) => {
                    self.last_activity = Instant::now();
                    self.parser.feed(&chunk[..n]);
                }
                Wake::Read(Err(e)) => return Err(e),
                Wake::Done(id, response) => {
                    if let Some(slot) = self.pending.get_mut(&id) {
                        slot.response = Some(response);
                    }
                }
                Wake::IdleTimeout => {
                    debug!(peer = ?self.peer_addr, "keep-alive timeout");
                    break;
                }
            }
        }

        // The peer may already be gone; nothing left to report.
        let _ = self.io.shutdown().await;
        Ok(())
    }

    fn wants_read(&self) -> bool {
        if self.read_closed {
            return false;
        }
        if self.current.is_some() {
            return true;
        }
        !self.closing
            && self.upgrade_barrier.is_none()
            && self.pending.len() < self.config.max_pipelined.max(1)
    }

    // Pulls parser events until more input is needed or a new request may not start.
    fn process_input(&mut self) {
        loop {
            if self.current.is_none()
                && (self.closing
                    || self.upgrade_barrier.is_some()
                    || self.pending.len() >= self.config.max_pipelined.max(1))
            {
                return;
            }
            match self.parser.next_event() {
                Ok(None) => return,
                Ok(Some(ParseEvent::Head(head))) => self.on_head(head),
                Ok(Some(ParseEvent::Body(bytes))) => {
                    if let Some(current) = &mut self.current {
                        current.body.extend_from_slice(&bytes);
                    }
                }
                Ok(Some(ParseEvent::Complete { trailers })) => self.on_complete(trailers),
                Err(e) => {
                    self.on_parse_error(e);
                    return;
                }
            }
        }
    }

    fn on_head(&mut self, head: RequestHead) {
        let id = self.next_id;
        self.next_id += 1;
        self.served += 1;

        let mut request = Request::from_head(id, head);
        request.set_addrs(self.peer_addr, self.local_addr);

        let max_requests = self.config.max_requests;
        let keep_alive = !self.config.disable_keep_alive
            && request.is_keep_alive()
            && (max_requests == 0 || self.served < max_requests);
        if !keep_alive {
            self.closing = true;
        }
        if request.headers().has_token("connection", "upgrade") {
            self.upgrade_barrier = Some(id);
        }

        debug!(
            peer = ?self.peer_addr,
            request_id = id,
            method = %request.method(),
            target = %request.target(),
            "request head received"
        );

        let answer = self.screen(&request);
        let chain = match answer {
            Some(_) => None,
            None => Some(self.hosts.select(&request).chain().clone()),
        };
        let slot = Slot {
            version: request.version(),
            head_request: *request.method() == Method::Head,
            keep_alive,
            requests_left: (max_requests > 0).then(|| max_requests.saturating_sub(self.served)),
            complete: false,
            expects_continue: answer.is_none()
                && request.version() == Version::Http11
                && request.expects_continue(),
            continue_sent: false,
            response: answer,
        };
        self.pending.insert(id, slot);
        self.current = Some(Receiving {
            request,
            body: BytesMut::new(),
            chain,
        });
    }

    // Requests the pipeline answers itself, before any responder sees them.
    fn screen(&self, request: &Request) -> Option<Response> {
        let config = &self.config;

        if request.version() == Version::Http11 && !request.headers().contains("host") {
            return Some(Response::error(StatusCode::BadRequest));
        }

        let method = request.method();
        if !config.allows_method(method.as_str()) {
            return Some(if method.is_standard() {
                Response::error(StatusCode::MethodNotAllowed)
                    .header("Allow", config.allowed_methods.join(", "))
            } else {
                Response::error(StatusCode::NotImplemented)
            });
        }

        match method {
            Method::Options if request.target() == "*" => Some(
                Response::new(StatusCode::Ok).header("Allow", config.allowed_methods.join(", ")),
            ),
            Method::Trace => Some(trace_echo(request)),
            _ => None,
        }
    }

    fn on_complete(&mut self, trailers: Headers) {
        let Some(current) = self.current.take() else {
            return;
        };
        let Receiving {
            mut request,
            body,
            chain,
        } = current;
        let id = request.id();
        if let Some(slot) = self.pending.get_mut(&id) {
            slot.complete = true;
        }
        let Some(chain) = chain else {
            return;
        };

        request.set_body(body.freeze());
        request.set_trailers(trailers);

        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let method = request.method().clone();
            let path = request.path().to_owned();
            let response = match tokio::spawn(chain.handle(request)).await {
                Ok(response) => response,
                Err(e) => {
                    error!(request_id = id, %method, %path, error = %e, "request handler failed");
                    Response::error(StatusCode::InternalServerError)
                }
            };
            // The connection may be gone; its responses are no longer wanted.
            let _ = done.send((id, response));
        });
    }

    fn on_parse_error(&mut self, err: ParseError) {
        warn!(peer = ?self.peer_addr, error = %err, "rejecting malformed request");
        self.closing = true;

        let response = Response::error(err.status());
        match self.current.take() {
            Some(current) => {
                if let Some(slot) = self.pending.get_mut(&current.request.id()) {
                    slot.response = Some(response);
                    slot.keep_alive = false;
                    slot.complete = true;
                    slot.expects_continue = false;
                }
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.pending.insert(
                    id,
                    Slot {
                        version: Version::Http11,
                        head_request: false,
                        keep_alive: false,
                        requests_left: None,
                        complete: true,
                        expects_continue: false,
                        continue_sent: false,
                        response: Some(response),
                    },
                );
            }
        }
    }

    // Writes every response ready at the front of the queue.
    async fn write_ready(&mut self) -> io::Result<Flow> {
        let config = Arc::clone(&self.config);
        let writer = ResponseWriter::new(&config);

        loop {
            let Some((&id, front)) = self.pending.iter_mut().next() else {
                return Ok(Flow::Continue);
            };
            if front.response.is_none() {
                if front.expects_continue && !front.continue_sent && !front.complete {
                    front.continue_sent = true;
                    writer.write_continue(&mut self.io, &mut self.out).await?;
                }
                return Ok(Flow::Continue);
            }
            let Some(mut slot) = self.pending.remove(&id) else {
                return Ok(Flow::Continue);
            };
            let Some(mut response) = slot.response.take() else {
                return Ok(Flow::Continue);
            };

            let upgrade = match response.take_upgrade() {
                Some(handler)
                    if slot.complete && response.status() == StatusCode::SwitchingProtocols =>
                {
                    Some(handler)
                }
                _ => None,
            };
            let framing = Framing {
                version: slot.version,
                head_request: slot.head_request,
                keep_alive: slot.keep_alive && slot.complete,
                requests_left: slot.requests_left,
                upgrading: upgrade.is_some(),
            };

            let keep_alive = writer.write(&mut self.io, &mut self.out, response, framing).await?;
            self.last_activity = Instant::now();

            if let Some(handler) = upgrade {
                return Ok(Flow::Upgrade(handler));
            }
            if self.upgrade_barrier == Some(id) {
                self.upgrade_barrier = None;
            }
            if !keep_alive {
                return Ok(Flow::Close);
            }
        }
    }

    async fn upgrade(mut self, handler: UpgradeHandler) -> io::Result<()> {
        debug!(peer = ?self.peer_addr, "switching protocols");
        let read_ahead = self.parser.take_remaining();
        handler(Upgraded::new(Box::new(self.io), read_ahead)).await;
        Ok(())
    }
}

// `TRACE` echoes the received request head back as `message/http`.
fn trace_echo(request: &Request) -> Response {
    let echo = format!(
        "{} {} {}\r\n{}\r\n",
        request.method(),
        request.target(),
        request.version(),
        request.headers()
    );
    Response::new(StatusCode::Ok)
        .header("Content-Type", "message/http")
        .body(echo)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::server::host::Host;

    fn spawn_pipeline(chain: Chain, config: ServerConfig) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let hosts = Arc::new(Hosts::new(Host::new("*", chain)));
        tokio::spawn(serve_connection(server, hosts, Arc::new(config), None, None));
        client
    }

    async fn read_all(mut client: DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn echo_path() -> Chain {
        Chain::from(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.path().to_owned())
        })
    }

    #[tokio::test]
    async fn responses_follow_request_order() {
        let chain = Chain::from(|req: Request| async move {
            if req.path() == "/slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Response::new(StatusCode::Ok).body(req.path().to_owned())
        });
        let mut client = spawn_pipeline(chain, ServerConfig::default());
        client
            .write_all(
                b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /fast HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /last HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let wire = read_all(client).await;
        let slow = wire.find("/slow").unwrap();
        let fast = wire.find("/fast").unwrap();
        let last = wire.find("/last").unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(slow < fast && fast < last, "{wire}");
    }

    #[tokio::test]
    async fn http10_defaults_to_close() {
        let mut client = spawn_pipeline(echo_path(), ServerConfig::default());
        client.write_all(b"GET /old HTTP/1.0\r\n\r\n").await.unwrap();
        let wire = read_all(client).await;
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(wire.ends_with("/old"));
    }

    #[tokio::test]
    async fn max_requests_forces_close() {
        let config = ServerConfig::default().with_max_requests(2);
        let mut client = spawn_pipeline(echo_path(), config);
        client
            .write_all(
                b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /2 HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /3 HTTP/1.1\r\nHost: x\r\n\r\n",
            )
            .await
            .unwrap();
        let wire = read_all(client).await;
        assert!(wire.contains("Keep-Alive: timeout=15, max=1\r\n"));
        assert_eq!(wire.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(wire.contains("Connection: close\r\n"));
        assert!(!wire.contains("/3"));
    }

    #[tokio::test]
    async fn missing_host_is_400() {
        let mut client = spawn_pipeline(echo_path(), ServerConfig::default());
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        assert!(read_all(client).await.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn method_screening() {
        let mut client = spawn_pipeline(echo_path(), ServerConfig::default());
        client
            .write_all(
                b"CONNECT x:443 HTTP/1.1\r\nHost: x\r\n\r\n\
                  BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n\
                  OPTIONS * HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let wire = read_all(client).await;
        let not_allowed = wire.find("HTTP/1.1 405 Method Not Allowed").unwrap();
        let not_impl = wire.find("HTTP/1.1 501 Not Implemented").unwrap();
        let options = wire.find("HTTP/1.1 200 OK").unwrap();
        assert!(not_allowed < not_impl && not_impl < options);
        assert!(wire.contains("Allow: GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS, TRACE\r\n"));
    }

    #[tokio::test]
    async fn trace_echoes_request_head() {
        let mut client = spawn_pipeline(echo_path(), ServerConfig::default());
        client
            .write_all(b"TRACE /t HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let wire = read_all(client).await;
        assert!(wire.contains("Content-Type: message/http\r\n"));
        assert!(wire.ends_with("TRACE /t HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n"));
    }

    #[tokio::test]
    async fn parse_error_follows_pending_responses() {
        let mut client = spawn_pipeline(echo_path(), ServerConfig::default());
        client
            .write_all(b"GET /ok HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/9.9\r\n\r\n")
            .await
            .unwrap();
        let wire = read_all(client).await;
        let ok = wire.find("HTTP/1.1 200 OK").unwrap();
        let bad = wire.find("505 HTTP Version Not Supported").unwrap();
        assert!(ok < bad);
        assert!(wire.contains("<html><body><h1>505 HTTP Version Not Supported</h1></body></html>"));
    }

    #[tokio::test]
    async fn expect_continue_is_sent_before_body() {
        let chain = Chain::from(|req: Request| async move {
            Response::new(StatusCode::Ok).body_bytes(req.body().clone())
        });
        let mut client = spawn_pipeline(chain, ServerConfig::default());
        client
            .write_all(
                b"PUT /f HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n\
                  Content-Length: 4\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut interim = [0u8; 25];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

        client.write_all(b"data").await.unwrap();
        let wire = read_all(client).await;
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.ends_with("data"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_500() {
        let chain = Chain::from(|req: Request| async move {
            if req.path() == "/boom" {
                panic!("handler exploded");
            }
            Response::new(StatusCode::Ok)
        });
        let mut client = spawn_pipeline(chain, ServerConfig::default());
        client
            .write_all(
                b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /fine HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let wire = read_all(client).await;
        let failed = wire.find("HTTP/1.1 500 Internal Server Error").unwrap();
        let fine = wire.find("HTTP/1.1 200 OK").unwrap();
        assert!(failed < fine);
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let mut client = spawn_pipeline(echo_path(), ServerConfig::default());
        client
            .write_all(b"HEAD /abc HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let wire = read_all(client).await;
        assert!(wire.contains("Content-Length: 4\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let config = ServerConfig::default().with_keep_alive_timeout(Duration::from_secs(2));
        let mut client = spawn_pipeline(echo_path(), config);
        client.write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        // Resolves once the server closes the idle connection.
        let wire = read_all(client).await;
        assert!(wire.ends_with("/a"));
    }

    #[tokio::test]
    async fn upgrade_hands_over_the_socket() {
        let chain = Chain::from(|_req: Request| async move {
            Response::new(StatusCode::SwitchingProtocols)
                .header("Connection", "Upgrade")
                .header("Upgrade", "echo")
                .on_upgrade(|mut upgraded: Upgraded| async move {
                    let mut buf = [0u8; 4];
                    if upgraded.read_exact(&mut buf).await.is_ok() {
                        let _ = upgraded.write_all(&buf).await;
                    }
                    let _ = upgraded.shutdown().await;
                })
        });
        let mut client = spawn_pipeline(chain, ServerConfig::default());
        client
            .write_all(
                b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\nping",
            )
            .await
            .unwrap();
        let wire = read_all(client).await;
        assert!(wire.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(wire.contains("Connection: Upgrade\r\n"));
        assert!(wire.ends_with("\r\n\r\nping"));
    }
}
