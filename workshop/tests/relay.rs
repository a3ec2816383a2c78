//! Integration tests for the traffic relay and its connection registry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use workshop::relay::{RelayConfig, Role, TrafficRelay};
use workshop_test_utils::{TestContext, spawn_echo_server, wait_until};

fn config(upstream: SocketAddr) -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        upstream,
        drain_grace: Duration::from_millis(200),
    }
}

async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

/// Upstream that accepts and then never reads or writes.
async fn spawn_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

#[tokio::test]
async fn closing_one_pair_leaves_the_other_intact() {
    let upstream = spawn_echo_server().await;
    let relay = TrafficRelay::bind(config(upstream)).await.unwrap();
    let addr = relay.local_addr();

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    echo_round_trip(&mut first, b"first").await;
    echo_round_trip(&mut second, b"second").await;
    assert!(wait_until(Duration::from_secs(2), || relay.connections() == 4).await);

    drop(first);
    assert!(wait_until(Duration::from_secs(2), || relay.connections() == 2).await);

    echo_round_trip(&mut second, b"still here").await;
    assert_eq!(relay.registry().count(Role::Inbound), 1);
    assert_eq!(relay.registry().count(Role::Outbound), 1);
    relay.shutdown().await.unwrap();
}

/// Upstream that echoes on its first connection and hangs up on every later one.
async fn spawn_flaky_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut first = true;
        while let Ok((mut socket, _)) = listener.accept().await {
            if !first {
                drop(socket);
                continue;
            }
            first = false;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn upstream_failure_only_drops_its_own_pair() {
    let upstream = spawn_flaky_server().await;
    let relay = TrafficRelay::bind(config(upstream)).await.unwrap();

    let mut healthy = TcpStream::connect(relay.local_addr()).await.unwrap();
    echo_round_trip(&mut healthy, b"ping").await;

    let mut doomed = TcpStream::connect(relay.local_addr()).await.unwrap();
    let _ = doomed.write_all(b"hello?").await;
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), doomed.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    // The guest's hangup reached the client as EOF; closing our side ends the pair.
    drop(doomed);
    assert!(wait_until(Duration::from_secs(2), || relay.connections() == 2).await);

    echo_round_trip(&mut healthy, b"pong").await;
    assert_eq!(relay.accepted(), 2);
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_destroys_lingering_connections_within_grace() {
    let upstream = spawn_silent_server().await;
    let relay = TrafficRelay::bind(config(upstream)).await.unwrap();
    let registry = relay.registry().clone();

    let _client = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || relay.connections() == 2).await);

    let started = Instant::now();
    let _ = relay.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn controller_stop_empties_registry_and_closes_listener() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    let addr = ctx.controller.relay_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    echo_round_trip(&mut client, b"through the relay").await;
    assert_eq!(ctx.controller.relay_connections(), 2);

    ctx.controller.stop_default().await.unwrap();

    assert_eq!(ctx.controller.relay_connections(), 0);
    assert!(ctx.controller.relay_addr().is_none());
    assert!(TcpStream::connect(addr).await.is_err());
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
}
