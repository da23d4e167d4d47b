// ABOUTME: Integration tests for local port forwarding and the SOCKS proxy.
// ABOUTME: Traffic flows client -> local listener -> gateway -> echo server and back.

mod support;

use dyno_exec::diagnostics::WarningKind;
use dyno_exec::error::Error;
use dyno_exec::ssh::SessionState;
use std::net::SocketAddr;
use std::time::Duration;
use support::control_plane::Scenario;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Start a TCP echo server on loopback.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// A loopback port with nothing listening.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo within timeout")
        .unwrap();
    buf
}

/// SOCKS5 no-auth greeting plus a CONNECT to an IPv4 destination.
async fn socks5_connect(proxy: SocketAddr, dest: SocketAddr) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let SocketAddr::V4(v4) = dest else {
        panic!("IPv4 destinations only");
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

/// Test: Forward a local port to an echo server behind the gateway.
/// Expected: Bytes round-trip and the gateway dials the destination once.
#[tokio::test]
async fn port_forward_reaches_remote_service() {
    let echo = echo_server().await;
    let h = support::harness(Scenario::default()).await;

    let tunnel = h
        .access
        .start_port_forward(&h.target, 0, "127.0.0.1", echo.port())
        .await
        .expect("start port forward");
    assert!(tunnel.local_addr().ip().is_loopback());

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    assert_eq!(roundtrip(&mut client, b"hello dyno").await, b"hello dyno");
    drop(client);

    assert_eq!(
        h.gateway.dials(),
        vec![("127.0.0.1".to_string(), u32::from(echo.port()))]
    );
    let stats = tunnel.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.dials, 1);
    assert_eq!(stats.failures, 0);

    tunnel.stop().await.expect("stop");
}

/// Test: Many clients use one port forward at the same time.
/// Expected: Each gets its own payload back over its own channel.
#[tokio::test]
async fn port_forward_serves_concurrent_clients() {
    let echo = echo_server().await;
    let h = support::harness(Scenario::default()).await;
    let tunnel = h
        .access
        .start_port_forward(&h.target, 0, "127.0.0.1", echo.port())
        .await
        .expect("start port forward");
    let local = tunnel.local_addr();

    let clients: Vec<_> = (0..16)
        .map(|i| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(local).await.unwrap();
                let payload = format!("client-{i:02}").into_bytes();
                let echoed = roundtrip(&mut stream, &payload).await;
                assert_eq!(echoed, payload);
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    assert_eq!(h.gateway.dials().len(), 16);
    assert_eq!(tunnel.stats().accepted, 16);
    tunnel.stop().await.expect("stop");
}

/// Test: Proxy a SOCKS5 CONNECT through the gateway.
/// Expected: Success reply, then bytes round-trip.
#[tokio::test]
async fn socks5_connect_reaches_destination() {
    let echo = echo_server().await;
    let h = support::harness(Scenario::default()).await;
    let tunnel = h
        .access
        .start_socks_proxy(&h.target, 0)
        .await
        .expect("start proxy");

    let (mut stream, status) = socks5_connect(tunnel.local_addr(), echo).await;
    assert_eq!(status, 0);
    assert_eq!(roundtrip(&mut stream, b"through socks").await, b"through socks");

    assert_eq!(
        h.gateway.dials(),
        vec![("127.0.0.1".to_string(), u32::from(echo.port()))]
    );
    tunnel.stop().await.expect("stop");
}

/// Test: Proxy a SOCKS4a request naming a host by domain.
/// Expected: The gateway dials the domain itself.
#[tokio::test]
async fn socks4a_passes_domain_to_gateway() {
    let echo = echo_server().await;
    let h = support::harness(Scenario::default()).await;
    let tunnel = h
        .access
        .start_socks_proxy(&h.target, 0)
        .await
        .expect("start proxy");

    let mut stream = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    let mut request = vec![4, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]);
    request.extend_from_slice(b"user\0localhost\0");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5a);

    assert_eq!(
        h.gateway.dials(),
        vec![("localhost".to_string(), u32::from(echo.port()))]
    );
    tunnel.stop().await.expect("stop");
}

/// Test: One client sends garbage while another is mid-conversation.
/// Expected: The bad client is dropped with a warning; the open one keeps relaying.
#[tokio::test]
async fn malformed_socks_client_is_isolated() {
    let echo = echo_server().await;
    let h = support::harness(Scenario::default()).await;
    let tunnel = h
        .access
        .start_socks_proxy(&h.target, 0)
        .await
        .expect("start proxy");

    let (mut good, status) = socks5_connect(tunnel.local_addr(), echo).await;
    assert_eq!(status, 0);
    assert_eq!(roundtrip(&mut good, b"before").await, b"before");

    let mut bad = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut rest = Vec::new();
    // Unread request bytes may turn the close into a reset; either ends it.
    let _ = tokio::time::timeout(Duration::from_secs(5), bad.read_to_end(&mut rest))
        .await
        .expect("bad client should be disconnected");

    assert_eq!(roundtrip(&mut good, b"after").await, b"after");

    let warnings = tunnel.forward().warnings();
    assert!(
        warnings
            .iter()
            .any(|w| w.kind == WarningKind::ConnectionRejected),
        "warnings: {warnings:?}"
    );
    assert_eq!(tunnel.session().state(), SessionState::Active);
    assert_eq!(h.gateway.dials().len(), 1);

    tunnel.stop().await.expect("stop");
}

/// Test: A client connects to the proxy and never sends a greeting.
/// Expected: It is disconnected after the connect timeout with a warning.
#[tokio::test]
async fn silent_socks_client_times_out() {
    let h = support::harness_with(Scenario::default(), |mut config| {
        config.connect_timeout = Duration::from_secs(1);
        config
    })
    .await;
    let tunnel = h
        .access
        .start_socks_proxy(&h.target, 0)
        .await
        .expect("start proxy");

    let mut silent = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), silent.read_to_end(&mut rest))
        .await
        .expect("silent client should be disconnected")
        .unwrap();

    let warnings = tunnel.forward().warnings();
    assert!(
        warnings
            .iter()
            .any(|w| w.kind == WarningKind::ConnectionRejected
                && w.message.contains("not completed")),
        "warnings: {warnings:?}"
    );
    assert_eq!(tunnel.stats().failures, 1);
    assert!(h.gateway.dials().is_empty());

    tunnel.stop().await.expect("stop");
}

/// Test: SOCKS5 CONNECT to a port where nothing listens on the remote side.
/// Expected: A failure reply, a dial warning, and the proxy keeps serving.
#[tokio::test]
async fn failed_remote_dial_is_reported_to_client() {
    let echo = echo_server().await;
    let h = support::harness(Scenario::default()).await;
    let tunnel = h
        .access
        .start_socks_proxy(&h.target, 0)
        .await
        .expect("start proxy");

    let dead = SocketAddr::from(([127, 0, 0, 1], closed_port()));
    let (_refused, status) = socks5_connect(tunnel.local_addr(), dead).await;
    assert_ne!(status, 0);

    let warnings = tunnel.forward().warnings();
    assert!(
        warnings.iter().any(|w| w.kind == WarningKind::DialFailed),
        "warnings: {warnings:?}"
    );
    assert_eq!(tunnel.stats().failures, 1);

    let (mut stream, status) = socks5_connect(tunnel.local_addr(), echo).await;
    assert_eq!(status, 0);
    assert_eq!(roundtrip(&mut stream, b"again").await, b"again");

    tunnel.stop().await.expect("stop");
}

/// Test: Stop a tunnel.
/// Expected: The listener no longer accepts and the session is Closed.
#[tokio::test]
async fn stop_releases_listener() {
    let h = support::harness(Scenario::default()).await;
    let tunnel = h
        .access
        .start_port_forward(&h.target, 0, "127.0.0.1", 9)
        .await
        .expect("start port forward");
    let local = tunnel.local_addr();
    let session_state = tunnel.session().subscribe_state();

    tunnel.stop().await.expect("stop");

    assert_eq!(*session_state.borrow(), SessionState::Closed);
    assert!(TcpStream::connect(local).await.is_err());
}

/// Test: Ask for a local port that is already taken.
/// Expected: Bind error, and the session opened for it is closed again.
#[tokio::test]
async fn occupied_local_port_is_a_bind_error() {
    let h = support::harness(Scenario::default()).await;
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = h
        .access
        .start_socks_proxy(&h.target, port)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Bind { .. }), "got {err:?}");
}
