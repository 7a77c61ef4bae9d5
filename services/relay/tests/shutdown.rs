
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{RelayHandle, TcpEchoBackend};
use relayd::{Mode, StaticBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn open_session(relay: &RelayHandle, payload: &[u8]) -> TcpStream {
    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
    client
}

#[tokio::test]
async fn shutdown_refuses_new_connections_and_ends_sessions_within_grace() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut relay = RelayHandle::spawn_with(
        Mode::Tcp,
        Arc::new(StaticBackend::new(backend.addr)),
        |config| config.grace_period = Duration::from_millis(300),
    )
    .await
    .unwrap();

    let mut first = open_session(&relay, b"one").await;
    let mut second = open_session(&relay, b"two").await;
    assert_eq!(relay.active(), 2);

    let started = Instant::now();
    relay.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(TcpStream::connect(relay.listen_addr).await.is_err());

    for client in [&mut first, &mut second] {
        let mut rest = Vec::new();
        let closed = timeout(Duration::from_secs(1), client.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "session should be closed after the grace period");
        assert!(rest.is_empty());
    }

    assert_eq!(relay.active(), 0);
    assert_eq!(relay.stats.sessions_aborted.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn sessions_keep_relaying_during_grace_period() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut relay = RelayHandle::spawn_with(
        Mode::Tcp,
        Arc::new(StaticBackend::new(backend.addr)),
        |config| config.grace_period = Duration::from_secs(5),
    )
    .await
    .unwrap();

    let mut client = open_session(&relay, b"before").await;

    relay.signal_shutdown();
    let task = relay.take_task().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.write_all(b"after").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"after");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(2), task)
        .await
        .expect("listener should finish once sessions drain")
        .unwrap();
    assert_eq!(relay.stats.sessions_aborted.load(Ordering::Relaxed), 0);
    assert_eq!(relay.stats.sessions_relayed.load(Ordering::Relaxed), 1);
}
