//! Live connection registry and per-connection tasks.
//!
//! Every upgraded socket is served by three tasks:
//!
//! - the connection task reads bytes, feeds the [`FrameParser`], enforces the
//!   byte and frame budgets, answers pings and runs the close handshake;
//! - the writer task drains the write queue, always taking queued control
//!   frames before the next data frame;
//! - the dispatcher calls the [`WebSocketApp`] one event at a time, so
//!   `on_open`, `on_data` and `on_close` are seen in order.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout};
use tracing::{debug, error, warn};

use super::budget::Budget;
use super::frame::{self, FrameError, FrameHandler, FrameParser, close_payload, encode_frame};
use super::handshake::{self, HandshakeInfo};
use super::message::{Message, MessageSender};
use super::{BoxError, ClientId, CloseCode, Opcode, WsError};
use crate::config::WebSocketConfig;
use crate::http::{Request, Response, StatusCode};
use crate::responder::{BoxFuture, Next, Responder};
use crate::server::Upgraded;

/// Application callbacks for a [`Gateway`].
///
/// Callbacks for one client run one at a time and in order. An error or a
/// panic in `on_open` or `on_data` closes that client with
/// [`CloseCode::InternalError`].
pub trait WebSocketApp: Send + Sync + 'static {
    /// Called by [`Gateway::start`].
    fn on_start(&self, endpoint: Endpoint) -> BoxFuture<Result<(), BoxError>> {
        let _ = endpoint;
        Box::pin(async { Ok(()) })
    }

    /// May amend the `101` response, or replace it to refuse the upgrade.
    fn on_handshake(&self, request: Request, response: Response) -> BoxFuture<Response> {
        let _ = request;
        Box::pin(async move { response })
    }

    /// A client connected.
    fn on_open(&self, client: ClientId, info: HandshakeInfo) -> BoxFuture<Result<(), BoxError>> {
        let _ = (client, info);
        Box::pin(async { Ok(()) })
    }

    /// A message started arriving.
    fn on_data(&self, client: ClientId, message: Message) -> BoxFuture<Result<(), BoxError>>;

    /// A client is gone. `code` is the peer's close code, or
    /// [`CloseCode::Abnormal`] when the socket dropped without one.
    fn on_close(&self, client: ClientId, code: u16, reason: String) -> BoxFuture<Result<(), BoxError>> {
        let _ = (client, code, reason);
        Box::pin(async { Ok(()) })
    }

    /// Called by [`Gateway::stop`].
    fn on_stop(&self, endpoint: Endpoint) -> BoxFuture<Result<(), BoxError>> {
        let _ = endpoint;
        Box::pin(async { Ok(()) })
    }
}

/// Traffic counters and timestamps of one connection.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: Instant,
    pub last_read: Instant,
    pub last_data_read: Instant,
    pub last_sent: Instant,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub frames_read: u64,
    pub frames_sent: u64,
    pub messages_read: u64,
    pub messages_sent: u64,
}

// Shared between the connection, writer and registry. Timestamps are
// milliseconds since `connected_at`.
#[derive(Debug)]
struct Stats {
    connected_at: Instant,
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    frames_read: AtomicU64,
    frames_sent: AtomicU64,
    messages_read: AtomicU64,
    messages_sent: AtomicU64,
    last_read: AtomicU64,
    last_data_read: AtomicU64,
    last_sent: AtomicU64,
}

impl Stats {
    fn new(connected_at: Instant) -> Self {
        Self {
            connected_at,
            bytes_read: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            messages_read: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            last_read: AtomicU64::new(0),
            last_data_read: AtomicU64::new(0),
            last_sent: AtomicU64::new(0),
        }
    }

    fn touch(&self, stamp: &AtomicU64) {
        let ms = self.connected_at.elapsed().as_millis() as u64;
        stamp.store(ms, Ordering::Relaxed);
    }

    fn instant(&self, stamp: &AtomicU64) -> Instant {
        self.connected_at + Duration::from_millis(stamp.load(Ordering::Relaxed))
    }

    fn snapshot(&self, id: ClientId, peer_addr: Option<SocketAddr>) -> ClientInfo {
        ClientInfo {
            id,
            peer_addr,
            connected_at: self.connected_at,
            last_read: self.instant(&self.last_read),
            last_data_read: self.instant(&self.last_data_read),
            last_sent: self.instant(&self.last_sent),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

// One data message queued for the writer.
struct Outgoing {
    frames: Vec<Bytes>,
    done: oneshot::Sender<Result<(), WsError>>,
}

// A control frame queued for the writer.
struct Control {
    frame: Bytes,
    close: bool,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
enum Command {
    Close { code: u16, reason: String },
    Fail { code: CloseCode, reason: String },
    WriteFailed,
}

enum AppEvent {
    Data(Message),
    Close(u16, String),
}

struct ClientHandle {
    data: mpsc::UnboundedSender<Outgoing>,
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<Stats>,
    peer_addr: Option<SocketAddr>,
}

struct Shared {
    app: Arc<dyn WebSocketApp>,
    config: WebSocketConfig,
    clients: DashMap<ClientId, ClientHandle>,
    next_id: AtomicU64,
}

impl Shared {
    fn enqueue(
        &self,
        client: ClientId,
        frames: Vec<Bytes>,
    ) -> Result<oneshot::Receiver<Result<(), WsError>>, WsError> {
        let handle = self.clients.get(&client).ok_or(WsError::UnknownClient(client))?;
        let (done, rx) = oneshot::channel();
        handle
            .data
            .send(Outgoing { frames, done })
            .map_err(|_| WsError::Closed(client))?;
        Ok(rx)
    }
}

/// Handle for talking to connected clients. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("clients", &self.shared.clients.len())
            .finish()
    }
}

impl Endpoint {
    /// Queues a message for `client`, fragmenting it above the configured
    /// auto-frame size. The frames are queued immediately; the returned
    /// future resolves once they are written.
    pub fn send(
        &self,
        client: ClientId,
        data: impl Into<Bytes>,
        binary: bool,
    ) -> BoxFuture<Result<(), WsError>> {
        let data = data.into();
        let frames = frame::encode_message(&data, binary, self.shared.config.auto_frame_size);
        let queued = self.shared.enqueue(client, frames);
        Box::pin(async move {
            match queued {
                Ok(rx) => rx.await.unwrap_or(Err(WsError::Closed(client))),
                Err(e) => Err(e),
            }
        })
    }

    /// Queues a text message for `client`.
    pub fn send_text(
        &self,
        client: ClientId,
        text: impl Into<String>,
    ) -> BoxFuture<Result<(), WsError>> {
        self.send(client, text.into(), false)
    }

    /// Sends to every client except those in `except`. Resolves to the
    /// number of clients the message was written to.
    pub fn broadcast(
        &self,
        data: impl Into<Bytes>,
        binary: bool,
        except: &[ClientId],
    ) -> BoxFuture<usize> {
        let targets: Vec<ClientId> = self
            .shared
            .clients
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !except.contains(id))
            .collect();
        self.send_many(data.into(), binary, &targets)
    }

    /// Sends to each listed client. Resolves to the number of clients the
    /// message was written to.
    pub fn multicast(
        &self,
        data: impl Into<Bytes>,
        binary: bool,
        clients: &[ClientId],
    ) -> BoxFuture<usize> {
        self.send_many(data.into(), binary, clients)
    }

    fn send_many(
        &self,
        data: Bytes,
        binary: bool,
        clients: &[ClientId],
    ) -> BoxFuture<usize> {
        // Encoded once; every client shares the frame buffers.
        let frames = frame::encode_message(&data, binary, self.shared.config.auto_frame_size);
        let pending: Vec<_> = clients
            .iter()
            .filter_map(|&id| self.shared.enqueue(id, frames.clone()).ok())
            .collect();
        Box::pin(async move {
            let mut delivered = 0;
            for rx in pending {
                if matches!(rx.await, Ok(Ok(()))) {
                    delivered += 1;
                }
            }
            delivered
        })
    }

    /// Starts the close handshake with `client`.
    ///
    /// # Errors
    ///
    /// [`WsError::InvalidCloseCode`] for codes that must not be sent and
    /// [`WsError::UnknownClient`] if the client is not connected.
    pub fn close(&self, client: ClientId, code: u16, reason: &str) -> Result<(), WsError> {
        if !CloseCode::is_sendable(code) {
            return Err(WsError::InvalidCloseCode(code));
        }
        let handle = self
            .shared
            .clients
            .get(&client)
            .ok_or(WsError::UnknownClient(client))?;
        handle
            .commands
            .send(Command::Close {
                code,
                reason: reason.to_owned(),
            })
            .map_err(|_| WsError::Closed(client))
    }

    /// Ids of all connected clients, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.shared.clients.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Counters for one client.
    pub fn info(&self, client: ClientId) -> Option<ClientInfo> {
        self.shared
            .clients
            .get(&client)
            .map(|handle| handle.stats.snapshot(client, handle.peer_addr))
    }
}

/// Accepts WebSocket upgrades as part of a responder chain.
///
/// Requests without `Upgrade: websocket` pass through to the next responder.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

impl Gateway {
    pub fn new<A: WebSocketApp>(app: A, config: WebSocketConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                app: Arc::new(app),
                config,
                clients: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the application's `on_start`.
    ///
    /// # Errors
    ///
    /// Whatever `on_start` returns.
    pub async fn start(&self) -> Result<(), BoxError> {
        self.shared.app.on_start(self.endpoint()).await
    }

    /// Asks every client to go away, then runs the application's `on_stop`.
    ///
    /// # Errors
    ///
    /// Whatever `on_stop` returns.
    pub async fn stop(&self) -> Result<(), BoxError> {
        let endpoint = self.endpoint();
        for id in endpoint.client_ids() {
            let _ = endpoint.close(id, CloseCode::GoingAway.as_u16(), "server shutting down");
        }
        self.shared.app.on_stop(endpoint).await
    }
}

impl Responder for Gateway {
    fn respond(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if !request.headers().has_token("upgrade", "websocket") {
                return next.run(request).await;
            }
            let key = match handshake::validate(&request) {
                Ok(key) => key.to_owned(),
                Err(e) => {
                    debug!(request_id = request.id(), error = %e, "websocket handshake rejected");
                    return e.into_response();
                }
            };

            let info = HandshakeInfo::from_request(&request);
            let app = Arc::clone(&shared.app);
            let response = app
                .on_handshake(request, handshake::switching_protocols(&key))
                .await;
            if response.status() != StatusCode::SwitchingProtocols {
                return response;
            }
            response.on_upgrade(move |io: Upgraded| serve(shared, io, info))
        })
    }
}

// Registers the connection and runs it to completion.
async fn serve(shared: Arc<Shared>, io: Upgraded, info: HandshakeInfo) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let now = Instant::now();
    let stats = Arc::new(Stats::new(now));
    let (reader, writer) = tokio::io::split(io);

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (app_tx, app_rx) = mpsc::unbounded_channel();

    shared.clients.insert(
        id,
        ClientHandle {
            data: data_tx,
            commands: command_tx.clone(),
            stats: Arc::clone(&stats),
            peer_addr: info.peer_addr,
        },
    );
    debug!(client_id = id, peer = ?info.peer_addr, "websocket connection opened");

    let writer = tokio::spawn(write_loop(
        id,
        writer,
        control_rx,
        data_rx,
        Arc::clone(&stats),
        command_tx.clone(),
    ));
    tokio::spawn(dispatch(Arc::clone(&shared.app), id, info, app_rx, command_tx));

    let config = &shared.config;
    let connection = Connection {
        id,
        parser: FrameParser::new(config),
        bytes: Budget::new(config.max_bytes_per_minute, Duration::from_secs(60), now),
        frames: Budget::new(u64::from(config.max_frames_per_second), Duration::from_secs(1), now),
        reader,
        control: control_tx,
        commands: command_rx,
        app: app_tx,
        stats,
        state: CloseState::Open,
        message: None,
        pings_outstanding: 0,
        last_read: now,
        close_deadline: None,
        closed_with: None,
        shared: Arc::clone(&shared),
    };
    connection.run(writer).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    CloseSent,
    CloseReceived,
    Closed,
}

// Events collected during one `FrameParser::feed` call.
#[derive(Default)]
struct Decoded(Vec<Frame>);

enum Frame {
    Data(Bytes, bool, bool),
    Control(Opcode, Bytes),
    Error(FrameError),
}

impl FrameHandler for Decoded {
    fn on_data(&mut self, payload: Bytes, binary: bool, fin: bool) {
        self.0.push(Frame::Data(payload, binary, fin));
    }

    fn on_control(&mut self, opcode: Opcode, payload: Bytes) {
        self.0.push(Frame::Control(opcode, payload));
    }

    fn on_error(&mut self, error: FrameError) {
        self.0.push(Frame::Error(error));
    }
}

struct Connection {
    id: ClientId,
    shared: Arc<Shared>,
    reader: ReadHalf<Upgraded>,
    parser: FrameParser,
    control: mpsc::UnboundedSender<Control>,
    commands: mpsc::UnboundedReceiver<Command>,
    app: mpsc::UnboundedSender<AppEvent>,
    stats: Arc<Stats>,
    bytes: Budget,
    frames: Budget,
    state: CloseState,
    message: Option<MessageSender>,
    pings_outstanding: u32,
    last_read: Instant,
    close_deadline: Option<Instant>,
    closed_with: Option<(u16, String)>,
}

impl Connection {
    async fn run(mut self, writer: JoinHandle<()>) {
        let config = self.shared.config.clone();
        let period = config.heartbeat_period.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; config.read_chunk_size.max(1)];

        while self.state != CloseState::Closed {
            let paused = self.bytes.is_exhausted() || self.frames.is_exhausted();
            let resume_at = self.resume_at();
            let close_deadline = self.close_deadline;
            let reading = !self.parser.is_failed();

            tokio::select! {
                read = self.reader.read(&mut buf), if reading && !paused => match read {
                    Ok(0) => {
                        debug!(client_id = self.id, "peer closed the connection");
                        break;
                    }
                    Ok(n) => self.on_read(&buf[..n]).await,
                    Err(e) => {
                        debug!(client_id = self.id, error = %e, "read failed");
                        break;
                    }
                },
                Some(command) = self.commands.recv() => self.on_command(command).await,
                _ = heartbeat.tick() => self.on_heartbeat(period).await,
                () = sleep_until(resume_at), if paused => {
                    let now = Instant::now();
                    self.bytes.replenish(now);
                    self.frames.replenish(now);
                    self.pings_outstanding = 0;
                    debug!(client_id = self.id, "read budget replenished");
                }
                () = sleep_until(close_deadline.unwrap_or(resume_at)), if close_deadline.is_some() => {
                    debug!(client_id = self.id, "close handshake timed out");
                    break;
                }
            }
        }

        self.teardown(writer);
    }

    fn resume_at(&self) -> Instant {
        match (self.bytes.is_exhausted(), self.frames.is_exhausted()) {
            (true, true) => self.bytes.next_refill().min(self.frames.next_refill()),
            (true, false) => self.bytes.next_refill(),
            _ => self.frames.next_refill(),
        }
    }

    async fn on_read(&mut self, data: &[u8]) {
        let now = Instant::now();
        self.last_read = now;
        self.pings_outstanding = 0;
        self.bytes.replenish(now);
        self.frames.replenish(now);
        self.stats.touch(&self.stats.last_read);
        self.stats.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);

        let mut decoded = Decoded::default();
        let frames = self.parser.feed(data, &mut decoded);
        self.stats.frames_read.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes.consume(data.len() as u64);
        self.frames.consume(frames as u64);

        for frame in decoded.0 {
            match frame {
                Frame::Data(payload, binary, fin) => self.on_data(payload, binary, fin),
                Frame::Control(opcode, payload) => self.on_control(opcode, payload).await,
                Frame::Error(e) => {
                    debug!(client_id = self.id, code = e.close_code().as_u16(), error = %e, "protocol error");
                    self.fail(e.close_code(), &e.to_string()).await;
                }
            }
        }

        if self.bytes.is_exhausted() || self.frames.is_exhausted() {
            debug!(client_id = self.id, "read budget exhausted; pausing reads");
        }
    }

    fn on_data(&mut self, payload: Bytes, binary: bool, fin: bool) {
        if self.state != CloseState::Open {
            return;
        }
        self.stats.touch(&self.stats.last_data_read);

        let sender = match self.message.take() {
            Some(sender) => sender,
            None => {
                let (sender, message) = Message::channel(binary);
                let _ = self.app.send(AppEvent::Data(message));
                sender
            }
        };
        sender.push(payload);
        if fin {
            sender.finish();
            self.stats.messages_read.fetch_add(1, Ordering::Relaxed);
        } else {
            self.message = Some(sender);
        }
    }

    async fn on_control(&mut self, opcode: Opcode, payload: Bytes) {
        match opcode {
            Opcode::Ping if self.state == CloseState::Open => {
                self.queue_control(Opcode::Pong, payload, None);
            }
            Opcode::Pong => self.pings_outstanding = 0,
            Opcode::Close => {
                let (code, reason) = frame::parse_close_payload(&payload);
                match self.state {
                    CloseState::Open => {
                        debug!(client_id = self.id, code, "peer started close handshake");
                        self.state = CloseState::CloseReceived;
                        self.message = None;
                        self.closed_with = Some((code, reason));
                        let echo = if payload.is_empty() {
                            Bytes::new()
                        } else {
                            close_payload(code, "")
                        };
                        let written = self.queue_close(echo);
                        let _ = timeout(self.shared.config.close_timeout, written).await;
                        self.state = CloseState::Closed;
                    }
                    CloseState::CloseSent => {
                        debug!(client_id = self.id, code, "close handshake complete");
                        self.closed_with = Some((code, reason));
                        self.state = CloseState::Closed;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Close { code, reason } => {
                if self.state != CloseState::Open {
                    return;
                }
                debug!(client_id = self.id, code, "closing connection");
                self.state = CloseState::CloseSent;
                self.message = None;
                self.closed_with = Some((code, reason.clone()));
                drop(self.queue_close(close_payload(code, &reason)));
                self.close_deadline = Some(Instant::now() + self.shared.config.close_timeout);
            }
            Command::Fail { code, reason } => self.fail(code, &reason).await,
            Command::WriteFailed => {
                debug!(client_id = self.id, "write failed");
                self.state = CloseState::Closed;
            }
        }
    }

    async fn on_heartbeat(&mut self, period: Duration) {
        if self.state != CloseState::Open || self.last_read.elapsed() < period {
            return;
        }
        // Pongs cannot be read while the budget holds reads back.
        if self.bytes.is_exhausted() || self.frames.is_exhausted() {
            return;
        }
        if self.pings_outstanding >= self.shared.config.queued_ping_limit {
            warn!(client_id = self.id, pings = self.pings_outstanding, "unanswered pings; closing");
            self.fail(CloseCode::PolicyViolation, "ping timeout").await;
            return;
        }
        self.pings_outstanding += 1;
        self.queue_control(Opcode::Ping, Bytes::new(), None);
    }

    // Sends a close frame, waits for it to leave and drops the connection.
    async fn fail(&mut self, code: CloseCode, reason: &str) {
        if self.state == CloseState::Closed {
            return;
        }
        self.message = None;
        if self.closed_with.is_none() {
            self.closed_with = Some((code.as_u16(), reason.to_owned()));
        }
        if matches!(self.state, CloseState::Open | CloseState::CloseReceived) {
            let written = self.queue_close(close_payload(code.as_u16(), reason));
            let _ = timeout(self.shared.config.close_timeout, written).await;
        }
        self.state = CloseState::Closed;
    }

    fn queue_control(&self, opcode: Opcode, payload: Bytes, done: Option<oneshot::Sender<()>>) {
        let control = Control {
            frame: encode_frame(opcode, &payload, true, None),
            close: opcode == Opcode::Close,
            done,
        };
        let _ = self.control.send(control);
    }

    fn queue_close(&self, payload: Bytes) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        self.queue_control(Opcode::Close, payload, Some(done));
        rx
    }

    fn teardown(mut self, writer: JoinHandle<()>) {
        self.message = None;
        self.shared.clients.remove(&self.id);
        writer.abort();

        let (code, reason) = self
            .closed_with
            .take()
            .unwrap_or((CloseCode::Abnormal.as_u16(), String::new()));
        debug!(client_id = self.id, code, "websocket connection closed");
        let _ = self.app.send(AppEvent::Close(code, reason));
    }
}

async fn write_loop(
    id: ClientId,
    mut io: WriteHalf<Upgraded>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut data: mpsc::UnboundedReceiver<Outgoing>,
    stats: Arc<Stats>,
    commands: mpsc::UnboundedSender<Command>,
) {
    if let Err(e) = drain(id, &mut io, &mut control, &mut data, &stats).await {
        debug!(client_id = id, error = %e, "websocket write failed");
        let _ = commands.send(Command::WriteFailed);
    }
    let _ = io.shutdown().await;
}

async fn drain(
    id: ClientId,
    io: &mut WriteHalf<Upgraded>,
    control: &mut mpsc::UnboundedReceiver<Control>,
    data: &mut mpsc::UnboundedReceiver<Outgoing>,
    stats: &Stats,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            biased;
            Some(frame) = control.recv() => {
                if write_control(io, frame, stats).await? {
                    return Ok(());
                }
            }
            Some(outgoing) = data.recv() => {
                let Outgoing { frames, done } = outgoing;
                for frame in frames {
                    // Control frames may be interleaved between fragments.
                    while let Ok(pending) = control.try_recv() {
                        if write_control(io, pending, stats).await? {
                            let _ = done.send(Err(WsError::Closed(id)));
                            return Ok(());
                        }
                    }
                    write_frame(io, &frame, stats).await?;
                }
                io.flush().await?;
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                let _ = done.send(Ok(()));
            }
            else => return Ok(()),
        }
    }
}

// Returns `true` once a close frame is out; nothing may follow it.
async fn write_control(io: &mut WriteHalf<Upgraded>, control: Control, stats: &Stats) -> std::io::Result<bool> {
    write_frame(io, &control.frame, stats).await?;
    io.flush().await?;
    if let Some(done) = control.done {
        let _ = done.send(());
    }
    Ok(control.close)
}

async fn write_frame(io: &mut WriteHalf<Upgraded>, frame: &[u8], stats: &Stats) -> std::io::Result<()> {
    io.write_all(frame).await?;
    stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
    stats.touch(&stats.last_sent);
    Ok(())
}

// Runs the application callbacks for one client in order.
async fn dispatch(
    app: Arc<dyn WebSocketApp>,
    id: ClientId,
    info: HandshakeInfo,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let mut healthy = match guarded(app.on_open(id, info)).await {
        Ok(()) => true,
        Err(reason) => {
            error!(client_id = id, "on_open failed: {reason}");
            let _ = commands.send(Command::Fail {
                code: CloseCode::InternalError,
                reason: "unexpected server error".to_owned(),
            });
            false
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Data(message) if healthy => {
                if let Err(reason) = guarded(app.on_data(id, message)).await {
                    error!(client_id = id, "on_data failed: {reason}");
                    let _ = commands.send(Command::Fail {
                        code: CloseCode::InternalError,
                        reason: "unexpected server error".to_owned(),
                    });
                    healthy = false;
                }
            }
            AppEvent::Data(_) => {}
            AppEvent::Close(code, reason) => {
                if let Err(e) = guarded(app.on_close(id, code, reason)).await {
                    error!(client_id = id, "on_close failed: {e}");
                }
                break;
            }
        }
    }
}

// Runs a callback on its own task so a panic is reported instead of unwinding here.
async fn guarded(callback: BoxFuture<Result<(), BoxError>>) -> Result<(), String> {
    match tokio::spawn(callback).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => Err("callback panicked".to_owned()),
        Err(e) => Err(e.to_string()),
    }
}
