//! End-to-end tests: client engine -> tunnel -> server engine -> remote

use gun_proto::StreamKind;
use gun_relay::{Client, RelayConfig, RelayHandle, Server};
use gun_transport::memory::{self, MemoryDialer};
use gun_transport::{GrpcConfig, GrpcDialer, GrpcListener};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// TCP server echoing every connection until EOF
async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// UDP server echoing every datagram to its sender
async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

struct MemoryTunnel {
    local: SocketAddr,
    dialer: Arc<MemoryDialer>,
    client: RelayHandle,
    server: RelayHandle,
}

/// Client and server engines joined by an in-memory channel
async fn memory_tunnel(remote: SocketAddr, config: RelayConfig) -> MemoryTunnel {
    let (dialer, acceptor) = memory::channel();
    let dialer = Arc::new(dialer);

    let server = Server::with_remote(acceptor, remote, config.clone());
    let server_handle = server.handle();
    tokio::spawn(server.run());

    let client = Client::bind(loopback(), dialer.clone(), config).await.unwrap();
    let local = client.local_addr().unwrap();
    let client_handle = client.handle();
    tokio::spawn(client.run());

    MemoryTunnel {
        local,
        dialer,
        client: client_handle,
        server: server_handle,
    }
}

async fn tcp_round_trip(local: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(payload).await.unwrap();
    conn.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(TEST_TIMEOUT, conn.read_to_end(&mut echoed))
        .await
        .expect("echo timeout")
        .unwrap();
    echoed
}

async fn udp_round_trip(socket: &UdpSocket, local: SocketAddr, payload: &[u8]) -> Vec<u8> {
    socket.send_to(payload, local).await.unwrap();
    let mut buf = vec![0u8; 65535];
    let (n, from) = timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("udp echo timeout")
        .unwrap();
    assert_eq!(from, local);
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_tcp_bytes_arrive_in_order() {
    init_tracing();
    let tunnel = memory_tunnel(tcp_echo().await, RelayConfig::default()).await;

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let echoed = tcp_round_trip(tunnel.local, &payload).await;
    assert_eq!(echoed, payload);
    assert_eq!(tunnel.dialer.opened(StreamKind::Stream), 1);
}

#[tokio::test]
async fn test_hundred_concurrent_connections() {
    init_tracing();
    let tunnel = memory_tunnel(tcp_echo().await, RelayConfig::default()).await;

    let tasks: Vec<_> = (0..100u32)
        .map(|i| {
            let local = tunnel.local;
            tokio::spawn(async move {
                let payload = format!("connection {} says {}", i, "x".repeat(i as usize * 37));
                let echoed = tcp_round_trip(local, payload.as_bytes()).await;
                assert_eq!(echoed, payload.as_bytes());
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(tunnel.dialer.opened(StreamKind::Stream), 100);
    eventually("client relays to finish", || tunnel.client.active_connections() == 0).await;
    eventually("server relays to finish", || tunnel.server.active_connections() == 0).await;
}

#[tokio::test]
async fn test_unreachable_remote_closes_local_connection() {
    init_tracing();
    // Bind then drop to get a port nobody listens on
    let dead = TcpListener::bind(loopback()).await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let tunnel = memory_tunnel(dead_addr, RelayConfig::default()).await;

    let mut conn = TcpStream::connect(tunnel.local).await.unwrap();
    let mut buf = Vec::new();
    let read = timeout(TEST_TIMEOUT, conn.read_to_end(&mut buf))
        .await
        .expect("connection was not closed");
    // Either a clean close or a reset, never data
    if read.is_ok() {
        assert!(buf.is_empty());
    }
    eventually("client relay to finish", || tunnel.client.active_connections() == 0).await;
}

#[tokio::test]
async fn test_udp_datagrams_from_one_peer_share_a_stream() {
    init_tracing();
    let tunnel = memory_tunnel(udp_echo().await, RelayConfig::default()).await;

    let app = UdpSocket::bind(loopback()).await.unwrap();
    for i in 0..10 {
        let payload = format!("datagram {}", i);
        let echoed = udp_round_trip(&app, tunnel.local, payload.as_bytes()).await;
        assert_eq!(echoed, payload.as_bytes());
    }

    assert_eq!(tunnel.dialer.opened(StreamKind::Datagram), 1);
    assert_eq!(tunnel.client.udp_sessions(), 1);
    assert_eq!(tunnel.server.udp_sessions(), 1);

    // A second peer gets its own stream
    let other = UdpSocket::bind(loopback()).await.unwrap();
    assert_eq!(udp_round_trip(&other, tunnel.local, b"hi").await, b"hi");
    assert_eq!(tunnel.dialer.opened(StreamKind::Datagram), 2);
    assert_eq!(tunnel.client.udp_sessions(), 2);
}

#[tokio::test]
async fn test_idle_udp_session_is_evicted_and_reopened() {
    init_tracing();
    let config = RelayConfig::default()
        .with_udp_timeout(Duration::from_millis(200))
        .with_reap_interval(Duration::from_millis(50));
    let tunnel = memory_tunnel(udp_echo().await, config).await;

    let app = UdpSocket::bind(loopback()).await.unwrap();
    assert_eq!(udp_round_trip(&app, tunnel.local, b"first").await, b"first");
    assert_eq!(tunnel.dialer.opened(StreamKind::Datagram), 1);

    eventually("client session eviction", || tunnel.client.udp_sessions() == 0).await;
    eventually("server session teardown", || tunnel.server.udp_sessions() == 0).await;

    assert_eq!(udp_round_trip(&app, tunnel.local, b"second").await, b"second");
    assert_eq!(tunnel.dialer.opened(StreamKind::Datagram), 2);
}

#[tokio::test]
async fn test_failed_udp_open_drops_session() {
    init_tracing();
    let tunnel = memory_tunnel(udp_echo().await, RelayConfig::default()).await;
    tunnel.dialer.set_unavailable(true);

    let app = UdpSocket::bind(loopback()).await.unwrap();
    app.send_to(b"lost", tunnel.local).await.unwrap();
    // The datagram reaches the client, then the failed open removes the session
    sleep(Duration::from_millis(100)).await;
    eventually("pending session removal", || tunnel.client.udp_sessions() == 0).await;
    assert_eq!(tunnel.dialer.opened(StreamKind::Datagram), 0);

    tunnel.dialer.set_unavailable(false);
    assert_eq!(udp_round_trip(&app, tunnel.local, b"found").await, b"found");
    assert_eq!(tunnel.dialer.opened(StreamKind::Datagram), 1);
}

#[tokio::test]
async fn test_shutdown_stops_client_and_sessions() {
    init_tracing();
    let tunnel = memory_tunnel(udp_echo().await, RelayConfig::default()).await;

    let app = UdpSocket::bind(loopback()).await.unwrap();
    assert_eq!(udp_round_trip(&app, tunnel.local, b"ping").await, b"ping");

    tunnel.client.shutdown();
    assert!(tunnel.client.is_shutdown());
    eventually("client sessions closed", || tunnel.client.udp_sessions() == 0).await;
    eventually("server sessions closed", || tunnel.server.udp_sessions() == 0).await;
}

/// Responds to one HTTP request with a fixed body, then closes
async fn http_responder(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_http_request_over_grpc_tls() {
    init_tracing();
    const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let responder = http_responder(RESPONSE).await;

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let listener = GrpcListener::bind(
        loopback(),
        Arc::new(GrpcConfig::server_with_identity(vec![cert_der.clone()], key_der)),
    )
    .await
    .unwrap();
    let server_addr = listener.local_addr();

    let server = Server::new(listener, &responder.to_string(), RelayConfig::default())
        .await
        .unwrap();
    let server_handle = server.handle();
    tokio::spawn(server.run());

    let dialer = GrpcDialer::new(
        server_addr.to_string(),
        Arc::new(
            GrpcConfig::client_default()
                .with_server_name("localhost")
                .with_root_cert(cert_der),
        ),
    )
    .unwrap();
    let client = Client::bind(loopback(), Arc::new(dialer), RelayConfig::default())
        .await
        .unwrap();
    let local = client.local_addr().unwrap();
    let client_handle = client.handle();
    tokio::spawn(client.run());

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, conn.read_to_end(&mut response))
        .await
        .expect("response timeout")
        .unwrap();
    assert_eq!(response, RESPONSE);

    drop(conn);
    eventually("client relay to finish", || client_handle.active_connections() == 0).await;
    eventually("server relay to finish", || server_handle.active_connections() == 0).await;
}

#[tokio::test]
async fn test_udp_over_grpc_cleartext() {
    init_tracing();
    let echo = udp_echo().await;

    let listener = GrpcListener::bind(loopback(), Arc::new(GrpcConfig::server_cleartext()))
        .await
        .unwrap();
    let server_addr = listener.local_addr();
    let server = Server::new(listener, &echo.to_string(), RelayConfig::default())
        .await
        .unwrap();
    tokio::spawn(server.run());

    let dialer = GrpcDialer::new(
        server_addr.to_string(),
        Arc::new(GrpcConfig::client_default().with_cleartext()),
    )
    .unwrap();
    let client = Client::bind(loopback(), Arc::new(dialer), RelayConfig::default())
        .await
        .unwrap();
    let local = client.local_addr().unwrap();
    tokio::spawn(client.run());

    let app = UdpSocket::bind(loopback()).await.unwrap();
    for payload in [&b"one"[..], &b"two"[..], &[7u8; 1400][..]] {
        assert_eq!(udp_round_trip(&app, local, payload).await, payload);
    }
}
