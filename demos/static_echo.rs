//! Serves a directory and echoes WebSocket messages on the same port.
//!
//! ```text
//! cargo run --example static_echo -- aerie.toml
//! RUST_LOG=aerie=debug cargo run --example static_echo
//! ```
//!
//! Without a config file the current directory is served on 127.0.0.1:8080.

use std::sync::OnceLock;

use aerie::config::{Config, RootConfig};
use aerie::http::{Response, StatusCode};
use aerie::responder::{from_fn, AccessLog, BoxFuture, Chain};
use aerie::root::Root;
use aerie::server::Server;
use aerie::websocket::{BoxError, ClientId, Endpoint, Gateway, HandshakeInfo, Message, WebSocketApp};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Default)]
struct Echo {
    endpoint: OnceLock<Endpoint>,
}

impl WebSocketApp for Echo {
    fn on_start(&self, endpoint: Endpoint) -> BoxFuture<Result<(), BoxError>> {
        let _ = self.endpoint.set(endpoint);
        Box::pin(async { Ok(()) })
    }

    fn on_open(&self, client: ClientId, info: HandshakeInfo) -> BoxFuture<Result<(), BoxError>> {
        tracing::info!(client, path = %info.path, "client joined");
        Box::pin(async { Ok(()) })
    }

    fn on_data(&self, client: ClientId, message: Message) -> BoxFuture<Result<(), BoxError>> {
        let endpoint = self.endpoint.get().cloned();
        Box::pin(async move {
            let binary = message.is_binary();
            let payload = message.buffer().await?;
            if let Some(endpoint) = endpoint {
                endpoint.send(client, payload, binary).await?;
            }
            Ok(())
        })
    }

    fn on_close(&self, client: ClientId, code: u16, reason: String) -> BoxFuture<Result<(), BoxError>> {
        tracing::info!(client, code, %reason, "client left");
        Box::pin(async { Ok(()) })
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aerie=info,static_echo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let listen = config
        .listen
        .first()
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:8080".to_owned());
    let root = config.root.clone().unwrap_or_else(|| RootConfig::new("."));

    let gateway = Gateway::new(Echo::default(), config.server.websocket.clone());
    gateway.start().await?;

    let chain = Chain::new()
        .with(AccessLog)
        .with(gateway.clone())
        .with(Root::new(root)?)
        .with_handler(from_fn(|_req| async {
            Response::error(StatusCode::NotFound)
        }));

    let server = Server::bind(&listen).await?.with_config(config.server);
    tokio::select! {
        result = server.run(chain) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    gateway.stop().await?;
    Ok(())
}
