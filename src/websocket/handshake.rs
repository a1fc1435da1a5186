//! Opening handshake (RFC 6455 §4.2).

use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::{Headers, Method, Request, Response, StatusCode, Version};

/// The WebSocket magic GUID used in the handshake.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Reasons an upgrade request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("upgrade requests must use GET")]
    MethodNotGet,

    #[error("upgrade requests must use HTTP/1.1")]
    HttpVersion,

    #[error("missing `Upgrade: websocket`")]
    MissingUpgrade,

    #[error("`Connection` header does not contain `upgrade`")]
    MissingConnectionUpgrade,

    #[error("unsupported Sec-WebSocket-Version {0:?}")]
    UnsupportedVersion(String),

    #[error("missing or malformed Sec-WebSocket-Key")]
    InvalidKey,
}

impl HandshakeError {
    /// The HTTP response sent back for a refused upgrade.
    pub fn into_response(self) -> Response {
        match self {
            Self::MethodNotGet => Response::error(StatusCode::MethodNotAllowed).header("Allow", "GET"),
            Self::UnsupportedVersion(_) => Response::error(StatusCode::UpgradeRequired)
                .header("Sec-WebSocket-Version", WEBSOCKET_VERSION),
            _ => Response::error(StatusCode::BadRequest),
        }
    }
}

/// What the application learns about a client when its connection opens.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// Request path.
    pub path: String,
    /// Query string without the `?`.
    pub query: Option<String>,
    /// Headers of the upgrade request.
    pub headers: Headers,
    /// Client address, when known.
    pub peer_addr: Option<SocketAddr>,
    /// Subprotocols the client offered, in preference order.
    pub protocols: Vec<String>,
}

impl HandshakeInfo {
    pub(crate) fn from_request(request: &Request) -> Self {
        Self {
            path: request.path().to_owned(),
            query: request.query_string().map(str::to_owned),
            headers: request.headers().clone(),
            peer_addr: request.peer_addr(),
            protocols: request
                .headers()
                .tokens("sec-websocket-protocol")
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Checks an upgrade request and returns its `Sec-WebSocket-Key`.
///
/// # Errors
///
/// Returns the first [`HandshakeError`] the request runs into.
pub fn validate(request: &Request) -> Result<&str, HandshakeError> {
    if request.method() != &Method::Get {
        return Err(HandshakeError::MethodNotGet);
    }
    if request.version() != Version::Http11 {
        return Err(HandshakeError::HttpVersion);
    }
    let headers = request.headers();
    if !headers.has_token("upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !headers.has_token("connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let version = headers.get("sec-websocket-version").map(str::trim).unwrap_or_default();
    if version != WEBSOCKET_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version.to_owned()));
    }

    let key = headers
        .get("sec-websocket-key")
        .map(str::trim)
        .ok_or(HandshakeError::InvalidKey)?;
    match STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(key),
        _ => Err(HandshakeError::InvalidKey),
    }
}

/// The `101 Switching Protocols` response for a validated key.
pub fn switching_protocols(key: &str) -> Response {
    Response::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(key))
}
