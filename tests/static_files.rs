use std::net::SocketAddr;

use aerie::config::RootConfig;
use aerie::http::{Response, StatusCode};
use aerie::responder::{from_fn, Chain};
use aerie::root::Root;
use aerie::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start(dir: &std::path::Path) -> SocketAddr {
    let root = Root::new(RootConfig::new(dir)).unwrap();
    let chain = Chain::new()
        .with(root)
        .with_handler(from_fn(|req| async move {
            Response::new(StatusCode::Ok).body(format!("dynamic {}", req.path()))
        }));

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(chain));
    addr
}

async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();
    String::from_utf8_lossy(&wire).into_owned()
}

fn site() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "hi").unwrap();
    std::fs::write(dir.path().join("digits.txt"), "0123456789").unwrap();
    dir
}

#[tokio::test]
async fn serves_a_file_over_tcp() {
    let dir = site();
    let addr = start(dir.path()).await;

    let wire = exchange(addr, "GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "{wire}");
    assert!(wire.contains("Content-Length: 2\r\n"), "{wire}");
    assert!(wire.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(wire.ends_with("\r\n\r\nhi"));
}

#[tokio::test]
async fn head_reports_length_without_body() {
    let dir = site();
    let addr = start(dir.path()).await;

    let wire = exchange(addr, "HEAD /digits.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "{wire}");
    assert!(wire.contains("Content-Length: 10\r\n"), "{wire}");
    assert!(wire.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn unknown_paths_reach_the_next_responder() {
    let dir = site();
    let addr = start(dir.path()).await;

    let wire = exchange(addr, "GET /api/users HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    assert!(wire.ends_with("dynamic /api/users"), "{wire}");
}

#[tokio::test]
async fn pipelined_file_and_range_requests_stay_in_order() {
    let dir = site();
    let addr = start(dir.path()).await;

    let wire = exchange(
        addr,
        "GET /digits.txt HTTP/1.1\r\nHost: x\r\nRange: bytes=2-4\r\n\r\n\
         GET /digits.txt HTTP/1.1\r\nHost: x\r\nRange: bytes=50-60\r\n\r\n\
         GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;

    let partial = wire.find("HTTP/1.1 206 Partial Content").unwrap();
    let unsatisfiable = wire.find("HTTP/1.1 416 Range Not Satisfiable").unwrap();
    let ok = wire.find("HTTP/1.1 200 OK").unwrap();
    assert!(partial < unsatisfiable && unsatisfiable < ok, "{wire}");
    assert!(wire.contains("Content-Range: bytes 2-4/10\r\n"));
    assert!(wire.contains("Content-Range: bytes */10\r\n"));
    assert!(wire.ends_with("hi"));
}

#[tokio::test]
async fn not_modified_beats_failed_unmodified_since() {
    let dir = site();
    let addr = start(dir.path()).await;

    let first = exchange(addr, "GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    let etag = first
        .lines()
        .find_map(|line| line.strip_prefix("ETag: "))
        .unwrap()
        .to_owned();

    let wire = exchange(
        addr,
        &format!(
            "GET /index.html HTTP/1.1\r\nHost: x\r\nIf-None-Match: {etag}\r\n\
             If-Unmodified-Since: Thu, 01 Jan 1970 00:00:00 GMT\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;
    assert!(wire.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{wire}");
    assert!(wire.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn traversal_is_confined_to_the_root() {
    let outer = tempfile::tempdir().unwrap();
    std::fs::write(outer.path().join("secret.txt"), "secret").unwrap();
    std::fs::create_dir(outer.path().join("public")).unwrap();
    std::fs::write(outer.path().join("public/index.html"), "hi").unwrap();
    let addr = start(&outer.path().join("public")).await;

    let wire = exchange(
        addr,
        "GET /../secret.txt HTTP/1.1\r\nHost: x\r\n\r\n\
         GET /%2e%2e/secret.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(!wire.contains("\r\n\r\nsecret"), "{wire}");
    assert_eq!(wire.matches("dynamic /").count(), 2, "{wire}");
}
