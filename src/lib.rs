//! # aerie
//!
//! An event-driven HTTP/1.1 server with WebSockets and static file serving.
//!
//! Requests flow through a per-host responder [`Chain`](responder::Chain).
//! Two responders ship with the crate:
//!
//! - [`Gateway`](websocket::Gateway) upgrades WebSocket handshakes and runs
//!   RFC 6455 connections for a [`WebSocketApp`](websocket::WebSocketApp).
//! - [`Root`](root::Root) serves files with conditional requests and byte
//!   ranges, passing unknown paths down the chain.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aerie::config::RootConfig;
//! use aerie::responder::{from_fn, Chain};
//! use aerie::root::Root;
//! use aerie::server::Server;
//! use aerie::http::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chain = Chain::new()
//!         .with(Root::new(RootConfig::new("./public"))?)
//!         .with_handler(from_fn(|_req| async {
//!             Response::new(StatusCode::NotFound).body("nothing here")
//!         }));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(chain).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod http;
pub mod responder;
pub mod root;
pub mod server;
pub mod websocket;

pub use config::{Config, RootConfig, ServerConfig, WebSocketConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use responder::{Chain, Responder};
pub use root::Root;
pub use server::{Server, ServerError};
pub use websocket::Gateway;
