//! RFC 6455 WebSockets.
//!
//! A [`Gateway`] sits in a host's responder chain. It answers valid upgrade
//! requests with `101 Switching Protocols`, after which every connection runs
//! on its own task: bytes are fed through the incremental [`FrameParser`],
//! decoded messages are handed to the [`WebSocketApp`] as lazy [`Message`]s,
//! and outgoing frames go through a write queue where control frames jump
//! ahead of data frames.
//!
//! ```rust,no_run
//! use aerie::config::WebSocketConfig;
//! use aerie::responder::{BoxFuture, Chain};
//! use aerie::websocket::{BoxError, ClientId, Endpoint, Gateway, Message, WebSocketApp};
//!
//! struct Echo(std::sync::OnceLock<Endpoint>);
//!
//! impl WebSocketApp for Echo {
//!     fn on_start(&self, endpoint: Endpoint) -> BoxFuture<Result<(), BoxError>> {
//!         let _ = self.0.set(endpoint);
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn on_data(&self, client: ClientId, message: Message) -> BoxFuture<Result<(), BoxError>> {
//!         let endpoint = self.0.get().cloned();
//!         Box::pin(async move {
//!             let binary = message.is_binary();
//!             let payload = message.buffer().await?;
//!             if let Some(endpoint) = endpoint {
//!                 endpoint.send(client, payload, binary).await?;
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//!
//! # async fn run() -> Result<(), BoxError> {
//! let gateway = Gateway::new(Echo(Default::default()), WebSocketConfig::default());
//! gateway.start().await?;
//! let chain = Chain::new().with(gateway);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use thiserror::Error;

mod budget;
pub mod frame;
mod gateway;
pub mod handshake;
mod message;

pub use frame::{FrameError, FrameHandler, FrameParser};
pub use gateway::{ClientInfo, Endpoint, Gateway, WebSocketApp};
pub use handshake::{HandshakeError, HandshakeInfo};
pub use message::Message;

/// Identifies one live connection for the lifetime of its [`Gateway`].
pub type ClientId = u64;

/// Error type returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the WebSocket API.
#[derive(Debug, Error)]
pub enum WsError {
    /// No live connection has this id.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// The connection closed before the frames were written.
    #[error("connection {0} is closed")]
    Closed(ClientId),

    /// The close code may not appear on the wire (1005, 1006, 1015 and
    /// unassigned ranges).
    #[error("close code {0} cannot be sent")]
    InvalidCloseCode(u16),

    /// The connection went away while a message was still being received.
    #[error("message aborted before its final frame")]
    MessageAborted,

    /// A text payload was not valid UTF-8.
    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    /// The upgrade request was rejected.
    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Decodes the low nibble of the first frame byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

/// Close status codes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005). Never sent on the wire.
    NoStatus = 1005,
    /// Abnormal closure (1006). Never sent on the wire.
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Extension required (1010).
    ExtensionRequired = 1010,
    /// Unexpected server error (1011).
    InternalError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015). Never sent on the wire.
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::ExtensionRequired),
            1011 => Some(Self::InternalError),
            1012 => Some(Self::ServiceRestart),
            1013 => Some(Self::TryAgainLater),
            1014 => Some(Self::BadGateway),
            1015 => Some(Self::TlsHandshake),
            _ => None,
        }
    }

    /// Get the numeric code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether a peer may send `code` in a close frame.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::Protocol => "protocol error",
            Self::Unsupported => "unsupported data",
            Self::NoStatus => "no status received",
            Self::Abnormal => "abnormal closure",
            Self::InvalidPayload => "invalid payload data",
            Self::PolicyViolation => "policy violation",
            Self::MessageTooBig => "message too big",
            Self::ExtensionRequired => "extension required",
            Self::InternalError => "unexpected server error",
            Self::ServiceRestart => "service restart",
            Self::TryAgainLater => "try again later",
            Self::BadGateway => "bad gateway",
            Self::TlsHandshake => "TLS handshake failure",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_control_bit() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Continuation.is_control());
        assert_eq!(Opcode::from_u8(0x3), None);
        assert_eq!(Opcode::from_u8(0xA), Some(Opcode::Pong));
    }

    #[test]
    fn close_code_conversions() {
        assert_eq!(CloseCode::from_u16(1002), Some(CloseCode::Protocol));
        assert_eq!(u16::from(CloseCode::InternalError), 1011);
        assert_eq!(CloseCode::Protocol.to_string(), "protocol error (1002)");
        assert!(CloseCode::is_sendable(4000));
        assert!(!CloseCode::is_sendable(1005));
        assert!(!CloseCode::is_sendable(1015));
        assert!(!CloseCode::is_sendable(999));
    }
}
