//! Server configuration — HTTP limits, keep-alive policy, WebSocket budgets,
//! and static file options.
//!
//! Every struct derives [`serde::Deserialize`] with `#[serde(default)]`, so a
//! TOML file only needs to name the values it overrides. Durations are written
//! as whole seconds.
//!
//! ```toml
//! listen = ["127.0.0.1:8080"]
//!
//! [server]
//! keep_alive_timeout = 30
//! max_requests = 500
//!
//! [server.websocket]
//! max_message_size = 1048576
//!
//! [root]
//! document_root = "./public"
//! cache_ttl = 5
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Addresses the server binds to.
    pub listen: Vec<String>,
    /// Connection and protocol settings shared by all hosts.
    pub server: ServerConfig,
    /// Optional static file root.
    pub root: Option<RootConfig>,
}

impl Config {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] when the text is not valid TOML or a value
    /// has the wrong type.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Toml`] if it cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

/// Size limits enforced by the HTTP message parser.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpLimits {
    /// Longest request line accepted, in bytes (default: 2048).
    pub max_start_line: usize,
    /// Largest header block accepted, in bytes (default: 8192).
    pub max_header_size: usize,
    /// Most header fields accepted in one message (default: 64).
    pub max_headers: usize,
    /// Largest request body accepted, in bytes (default: 2 MiB).
    pub max_body_size: u64,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_start_line: 2048,
            max_header_size: 8192,
            max_headers: 64,
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Connection-level settings for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Value of the `Server` response header. Empty disables the header.
    pub server_token: String,
    /// Idle time after which a connection with no request in flight is closed.
    #[serde(with = "secs")]
    pub keep_alive_timeout: Duration,
    /// Requests served on one connection before `Connection: close` is forced.
    /// Zero means unlimited.
    pub max_requests: usize,
    /// Close every connection after its first response.
    pub disable_keep_alive: bool,
    /// Pipelined requests allowed in flight before reading is paused.
    pub max_pipelined: usize,
    /// Fill empty reason phrases from the standard status table.
    pub auto_reason_phrase: bool,
    /// Methods accepted by the server; anything else gets `405`/`501`.
    pub allowed_methods: Vec<String>,
    /// Parser size limits.
    pub limits: HttpLimits,
    /// WebSocket limits and timers.
    pub websocket: WebSocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_token: concat!("aerie/", env!("CARGO_PKG_VERSION")).to_owned(),
            keep_alive_timeout: Duration::from_secs(15),
            max_requests: 1000,
            disable_keep_alive: false,
            max_pipelined: 32,
            auto_reason_phrase: true,
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "TRACE"]
                .iter()
                .map(|m| (*m).to_owned())
                .collect(),
            limits: HttpLimits::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Sets the keep-alive idle timeout.
    #[must_use]
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Sets the per-connection request limit.
    #[must_use]
    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    /// Disables or enables persistent connections.
    #[must_use]
    pub fn with_keep_alive_disabled(mut self, disabled: bool) -> Self {
        self.disable_keep_alive = disabled;
        self
    }

    /// Replaces the parser size limits.
    #[must_use]
    pub fn with_limits(mut self, limits: HttpLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replaces the WebSocket settings.
    #[must_use]
    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    /// Returns `true` if `method` is on the allow-list.
    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }
}

/// WebSocket frame limits, flow control budgets and timers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Largest single frame payload accepted (default: 2 MiB).
    pub max_frame_size: u64,
    /// Largest reassembled message accepted (default: 10 MiB).
    pub max_message_size: u64,
    /// Outgoing payloads larger than this are split into fragments (default: 32 KiB).
    pub auto_frame_size: usize,
    /// Buffered message bytes that force an early partial delivery (default: 32 KiB).
    pub emit_threshold: usize,
    /// Bytes a client may send per minute before reads pause (default: 8 MiB).
    pub max_bytes_per_minute: u64,
    /// Frames a client may send per second before reads pause (default: 100).
    pub max_frames_per_second: u32,
    /// Idle time after which a ping is sent.
    #[serde(with = "secs")]
    pub heartbeat_period: Duration,
    /// Unanswered pings tolerated before a policy-violation close (default: 3).
    pub queued_ping_limit: u32,
    /// Grace period for the peer to answer a close frame.
    #[serde(with = "secs")]
    pub close_timeout: Duration,
    /// Bytes read from the socket per readiness event (default: 8 KiB).
    pub read_chunk_size: usize,
    /// Validate UTF-8 in text messages (default: true).
    pub validate_utf8: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 2 * 1024 * 1024,
            max_message_size: 10 * 1024 * 1024,
            auto_frame_size: 32 * 1024,
            emit_threshold: 32 * 1024,
            max_bytes_per_minute: 8 * 1024 * 1024,
            max_frames_per_second: 100,
            heartbeat_period: Duration::from_secs(10),
            queued_ping_limit: 3,
            close_timeout: Duration::from_secs(10),
            read_chunk_size: 8 * 1024,
            validate_utf8: true,
        }
    }
}

impl WebSocketConfig {
    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: u64) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub fn max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the outgoing fragmentation size.
    #[must_use]
    pub fn auto_frame_size(mut self, size: usize) -> Self {
        self.auto_frame_size = size;
        self
    }

    /// Set the per-minute byte budget.
    #[must_use]
    pub fn max_bytes_per_minute(mut self, bytes: u64) -> Self {
        self.max_bytes_per_minute = bytes;
        self
    }

    /// Set the per-second frame budget.
    #[must_use]
    pub fn max_frames_per_second(mut self, frames: u32) -> Self {
        self.max_frames_per_second = frames;
        self
    }

    /// Set the heartbeat period.
    #[must_use]
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Set the close handshake grace period.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Static file engine options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Directory served by the engine.
    pub document_root: PathBuf,
    /// Index files probed, in order, for directory requests.
    pub index_files: Vec<String>,
    /// Lifetime of a stat cache entry.
    #[serde(with = "secs")]
    pub cache_ttl: Duration,
    /// Stat cache entries kept at most.
    pub max_cache_entries: usize,
    /// Files up to this size are held in memory.
    pub buffered_file_max_size: u64,
    /// In-memory files kept at most.
    pub max_buffered_files: usize,
    /// Lifetime advertised through `Cache-Control`/`Expires`.
    #[serde(with = "secs")]
    pub expires_period: Duration,
    /// Emit `pre-check`/`post-check` cache directives.
    pub use_aggressive_cache_headers: bool,
    /// `pre-check` value used by aggressive cache headers.
    pub aggressive_pre_check: u64,
    /// `post-check` value used by aggressive cache headers.
    pub aggressive_post_check: u64,
    /// Honor `Cache-Control: no-cache`/`Pragma: no-cache` by bypassing the stat cache.
    pub debug: bool,
    /// Mix the inode into ETags.
    pub etag_include_inode: bool,
    /// Type sent when the extension is unknown.
    pub default_mime_type: String,
    /// Charset appended to `text/*` types.
    pub default_charset: String,
    /// Extension to MIME type overrides, merged over the built-in table.
    pub mime_types: HashMap<String, String>,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            document_root: PathBuf::from("."),
            index_files: vec!["index.html".to_owned(), "index.htm".to_owned()],
            cache_ttl: Duration::from_secs(10),
            max_cache_entries: 2048,
            buffered_file_max_size: 512 * 1024,
            max_buffered_files: 50,
            expires_period: Duration::from_secs(7 * 24 * 3600),
            use_aggressive_cache_headers: false,
            aggressive_pre_check: 3600,
            aggressive_post_check: 900,
            debug: false,
            etag_include_inode: true,
            default_mime_type: "text/plain".to_owned(),
            default_charset: "utf-8".to_owned(),
            mime_types: HashMap::new(),
        }
    }
}

impl RootConfig {
    /// Creates a configuration serving `document_root` with default options.
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self {
            document_root: document_root.into(),
            ..Self::default()
        }
    }

    /// Set the stat cache TTL.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the index files probed for directories.
    #[must_use]
    pub fn index_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Set the in-memory buffering limits.
    #[must_use]
    pub fn buffering(mut self, max_size: u64, max_files: usize) -> Self {
        self.buffered_file_max_size = max_size;
        self.max_buffered_files = max_files;
        self
    }

    /// Set the maximum number of stat cache entries.
    #[must_use]
    pub fn max_cache_entries(mut self, max: usize) -> Self {
        self.max_cache_entries = max;
        self
    }

    /// Enable debug cache bypass.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

// Durations are configured as whole seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(15));
        assert_eq!(config.max_requests, 1000);
        assert!(config.allows_method("GET"));
        assert!(!config.allows_method("BREW"));
        assert_eq!(config.websocket.queued_ping_limit, 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let text = r#"
            listen = ["127.0.0.1:9000"]

            [server]
            keep_alive_timeout = 30
            disable_keep_alive = true

            [server.websocket]
            max_frames_per_second = 5

            [root]
            document_root = "/srv/www"
            cache_ttl = 3
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.listen, vec!["127.0.0.1:9000"]);
        assert_eq!(config.server.keep_alive_timeout, Duration::from_secs(30));
        assert!(config.server.disable_keep_alive);
        assert_eq!(config.server.max_requests, 1000);
        assert_eq!(config.server.websocket.max_frames_per_second, 5);
        assert_eq!(config.server.websocket.heartbeat_period, Duration::from_secs(10));

        let root = config.root.unwrap();
        assert_eq!(root.document_root, PathBuf::from("/srv/www"));
        assert_eq!(root.cache_ttl, Duration::from_secs(3));
        assert_eq!(root.index_files, vec!["index.html", "index.htm"]);
    }

    #[test]
    fn invalid_toml() {
        let err = Config::from_toml_str("[server]\nmax_requests = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
