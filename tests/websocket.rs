use std::net::SocketAddr;
use std::sync::OnceLock;

use aerie::config::WebSocketConfig;
use aerie::responder::{BoxFuture, Chain};
use aerie::server::Server;
use aerie::websocket::frame::{self, parse_close_payload};
use aerie::websocket::{BoxError, ClientId, Endpoint, Gateway, Message, Opcode, WebSocketApp};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Default)]
struct Echo(OnceLock<Endpoint>);

impl WebSocketApp for Echo {
    fn on_start(&self, endpoint: Endpoint) -> BoxFuture<Result<(), BoxError>> {
        let _ = self.0.set(endpoint);
        Box::pin(async { Ok(()) })
    }

    fn on_data(&self, client: ClientId, message: Message) -> BoxFuture<Result<(), BoxError>> {
        let endpoint = self.0.get().cloned();
        Box::pin(async move {
            let binary = message.is_binary();
            let payload = message.buffer().await?;
            if let Some(endpoint) = endpoint {
                endpoint.send(client, payload, binary).await?;
            }
            Ok(())
        })
    }
}

async fn start() -> SocketAddr {
    let gateway = Gateway::new(Echo::default(), WebSocketConfig::default());
    gateway.start().await.unwrap();

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(Chain::new().with(gateway)));
    addr
}

async fn connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"), "{head}");
    stream
}

/// Reads one unmasked server frame with a short payload.
async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames are unmasked");
    let mut payload = vec![0u8; usize::from(header[1] & 0x7f)];
    stream.read_exact(&mut payload).await.unwrap();
    (header[0], payload)
}

#[tokio::test]
async fn echo_and_close_handshake() {
    let addr = start().await;
    let mut stream = connect(addr).await;

    let hello = frame::encode_frame(Opcode::Text, b"hello", true, Some([1, 2, 3, 4]));
    stream.write_all(&hello).await.unwrap();
    let (first, payload) = read_frame(&mut stream).await;
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"hello");

    let close = frame::encode_frame(Opcode::Close, &frame::close_payload(1000, "bye"), true, Some([9, 9, 9, 9]));
    stream.write_all(&close).await.unwrap();
    let (first, payload) = read_frame(&mut stream).await;
    assert_eq!(first, 0x88);
    assert_eq!(parse_close_payload(&payload).0, 1000);
}

#[tokio::test]
async fn unmasked_client_frame_fails_with_1002() {
    let addr = start().await;
    let mut stream = connect(addr).await;

    stream.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();
    let (first, payload) = read_frame(&mut stream).await;
    assert_eq!(first, 0x88);
    assert_eq!(parse_close_payload(&payload).0, 1002);
}

#[tokio::test]
async fn plain_requests_are_not_upgraded() {
    let addr = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();
    assert!(wire.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
}
