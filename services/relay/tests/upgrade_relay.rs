
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use harness::{
    dead_addr, raw_request, read_response_head, upgrade_request, RelayHandle, TcpEchoBackend,
};
use relayd::{Mode, StaticBackend};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

async fn read_at_least(stream: &mut TcpStream, mut have: Vec<u8>, len: usize) -> Vec<u8> {
    let mut chunk = [0u8; 256];
    while have.len() < len {
        let n = timeout(Duration::from_secs(2), stream.read(&mut chunk))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "connection closed early");
        have.extend_from_slice(&chunk[..n]);
    }
    have
}

#[tokio::test]
async fn upgrade_response_precedes_backend_bytes() {
    let backend = TcpEchoBackend::spawn_with_greeting(Some(b"hello"))
        .await
        .unwrap();
    let relay = RelayHandle::spawn(Mode::Upgrade, backend.addr).await.unwrap();

    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    client
        .write_all(upgrade_request("/speed").as_bytes())
        .await
        .unwrap();

    let (head, rest) = read_response_head(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n")));

    let greeting = read_at_least(&mut client, rest, 5).await;
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn upgrade_head_bytes_reach_backend_first() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(Mode::Upgrade, backend.addr).await.unwrap();

    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    let mut request = upgrade_request("/speed").into_bytes();
    request.extend_from_slice(b"abc");
    client.write_all(&request).await.unwrap();

    let (head, rest) = read_response_head(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"));

    let echoed = read_at_least(&mut client, rest, 3).await;
    assert_eq!(&echoed[..3], b"abc");

    client.write_all(b"def").await.unwrap();
    let echoed = read_at_least(&mut client, echoed, 6).await;
    assert_eq!(echoed, b"abcdef");

    let first_reads = backend.first_reads.lock().await;
    assert!(first_reads[0].starts_with(b"abc"));
}

#[tokio::test]
async fn websocket_client_accepts_handshake() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(Mode::Upgrade, backend.addr).await.unwrap();

    let stream = TcpStream::connect(relay.listen_addr).await.unwrap();
    let (_ws, response) =
        tokio_tungstenite::client_async("ws://edge.example.test/speed", stream)
            .await
            .expect("handshake should validate");
    assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);
}

#[tokio::test]
async fn upgrade_backend_down_returns_503() {
    let relay = RelayHandle::spawn(Mode::Upgrade, dead_addr().await)
        .await
        .unwrap();

    let response = raw_request(relay.listen_addr, &upgrade_request("/speed"))
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 503"), "{response}");
    assert!(!response.contains("101"));

    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(relay.stats.backend_unavailable.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn upgrade_without_tunnel_path_is_rejected() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn_with(
        Mode::Upgrade,
        Arc::new(StaticBackend::new(backend.addr)),
        |config| config.routes.tunnel_path = None,
    )
    .await
    .unwrap();

    let response = raw_request(relay.listen_addr, &upgrade_request("/speed"))
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert_eq!(backend.connection_count(), 0);
}

#[rstest]
#[case::wrong_path(upgrade_request("/other"), "HTTP/1.1 404")]
#[case::malformed("NOT A REQUEST\r\n\r\n".to_string(), "HTTP/1.1 400")]
#[case::post_status("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n".to_string(), "HTTP/1.1 405")]
#[tokio::test]
async fn upgrade_refusals_never_touch_backend(#[case] request: String, #[case] expected: &str) {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(Mode::Upgrade, backend.addr).await.unwrap();

    let response = raw_request(relay.listen_addr, &request).await.unwrap();
    assert!(response.starts_with(expected), "{response}");
    assert_eq!(backend.connection_count(), 0);
}

#[rstest]
#[case::status("/", "200", "System Online")]
#[case::health("/healthz", "200", "\"status\":\"ok\"")]
#[case::not_found("/missing", "404", "Not Found")]
#[tokio::test]
async fn local_routes_served_without_backend(
    #[case] path: &str,
    #[case] status: &str,
    #[case] body: &str,
) {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(Mode::Upgrade, backend.addr).await.unwrap();

    let request = format!("GET {path} HTTP/1.1\r\nHost: edge.example.test\r\n\r\n");
    let response = raw_request(relay.listen_addr, &request).await.unwrap();
    assert!(
        response.starts_with(&format!("HTTP/1.1 {status}")),
        "{response}"
    );
    assert!(response.contains(body), "{response}");
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn descriptor_route_serves_encoded_link() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(Mode::Upgrade, backend.addr).await.unwrap();

    let response = raw_request(
        relay.listen_addr,
        "GET /sub HTTP/1.1\r\nHost: edge.example.test\r\n\r\n",
    )
    .await
    .unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));

    let link = String::from_utf8(STANDARD.decode(body.trim()).unwrap()).unwrap();
    assert!(link.starts_with("vless://"), "{link}");
    assert!(link.contains("@edge.example.test:"));
    assert!(link.contains("type=ws"));
    assert!(link.contains("path=/speed"));
}
