//! Integration tests for the gRPC channel over loopback sockets

use gun_proto::Code;
use gun_transport::{
    GrpcConfig, GrpcDialer, GrpcListener, Hunk, Status, StreamKind, TransportError, TunnelAcceptor,
    TunnelDialer, TunnelRecv, TunnelSend, TunnelStream,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn cleartext_pair() -> (GrpcListener, GrpcDialer) {
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = GrpcListener::bind(bind_addr, Arc::new(GrpcConfig::server_cleartext()))
        .await
        .expect("Failed to bind listener");

    let dialer = GrpcDialer::new(
        listener.local_addr().to_string(),
        Arc::new(GrpcConfig::client_default().with_cleartext()),
    )
    .expect("Failed to create dialer");

    (listener, dialer)
}

async fn accept<A: TunnelAcceptor>(acceptor: &A) -> gun_transport::IncomingCall<A::Stream> {
    timeout(TEST_TIMEOUT, acceptor.accept())
        .await
        .expect("Accept timeout")
        .expect("Accept failed")
        .expect("Listener closed")
}

async fn recv<R: TunnelRecv>(receiver: &mut R) -> Result<Option<Hunk>, TransportError> {
    timeout(TEST_TIMEOUT, receiver.recv())
        .await
        .expect("Receive timeout")
}

#[tokio::test]
async fn test_cleartext_round_trip_and_half_close() {
    let (listener, dialer) = cleartext_pair().await;

    let client = dialer.open(StreamKind::Stream).await.expect("Open failed");
    let (mut client_tx, mut client_rx) = client.split();
    client_tx.send(Hunk::new(&b"hello"[..])).await.unwrap();

    let call = accept(&listener).await;
    assert_eq!(call.kind, StreamKind::Stream);
    let (mut server_tx, mut server_rx) = call.stream.split();

    let hunk = recv(&mut server_rx).await.unwrap().unwrap();
    assert_eq!(hunk.data, &b"hello"[..]);

    server_tx.send(Hunk::new(&b"world"[..])).await.unwrap();
    let hunk = recv(&mut client_rx).await.unwrap().unwrap();
    assert_eq!(hunk.data, &b"world"[..]);

    // Client half-close reaches the server as a clean end of stream
    client_tx.close_send().await.unwrap();
    assert!(recv(&mut server_rx).await.unwrap().is_none());

    // Server can still reply after the client stopped sending
    server_tx.send(Hunk::new(&b"late"[..])).await.unwrap();
    assert_eq!(recv(&mut client_rx).await.unwrap().unwrap().data, &b"late"[..]);

    server_tx.close_send().await.unwrap();
    assert!(recv(&mut client_rx).await.unwrap().is_none());
}

#[tokio::test]
async fn test_large_hunks_are_reassembled() {
    let (listener, dialer) = cleartext_pair().await;

    let (mut client_tx, _client_rx) = dialer.open(StreamKind::Stream).await.unwrap().split();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let expected = payload.clone();
    let sender = tokio::spawn(async move {
        client_tx.send(Hunk::new(payload)).await.unwrap();
        client_tx
    });

    let call = accept(&listener).await;
    let (_server_tx, mut server_rx) = call.stream.split();
    let hunk = recv(&mut server_rx).await.unwrap().unwrap();
    assert_eq!(hunk.data.as_ref(), expected.as_slice());

    let _client_tx = sender.await.unwrap();
}

#[tokio::test]
async fn test_server_abort_reaches_client_as_status() {
    let (listener, dialer) = cleartext_pair().await;

    let (mut client_tx, mut client_rx) = dialer.open(StreamKind::Stream).await.unwrap().split();
    client_tx.send(Hunk::new(&b"x"[..])).await.unwrap();

    let call = accept(&listener).await;
    let (mut server_tx, _server_rx) = call.stream.split();
    server_tx
        .abort(Status::new(Code::Unavailable, "dial 127.0.0.1:1 failed"))
        .await
        .unwrap();

    let err = recv(&mut client_rx).await.unwrap_err();
    match &err {
        TransportError::Status(status) => {
            assert_eq!(status.code, Code::Unavailable);
            assert_eq!(status.message, "dial 127.0.0.1:1 failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_benign());
}

#[tokio::test]
async fn test_client_abort_is_benign_for_server() {
    let (listener, dialer) = cleartext_pair().await;

    let (mut client_tx, _client_rx) = dialer.open(StreamKind::Datagram).await.unwrap().split();
    client_tx.send(Hunk::new(&b"x"[..])).await.unwrap();

    let call = accept(&listener).await;
    assert_eq!(call.kind, StreamKind::Datagram);
    let (_server_tx, mut server_rx) = call.stream.split();
    assert!(recv(&mut server_rx).await.unwrap().is_some());

    client_tx.abort(Status::new(Code::Cancelled, "")).await.unwrap();

    let err = recv(&mut server_rx).await.unwrap_err();
    assert!(err.is_benign(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_unknown_service_is_unimplemented() {
    let (listener, _) = cleartext_pair().await;
    let dialer = GrpcDialer::new(
        listener.local_addr().to_string(),
        Arc::new(
            GrpcConfig::client_default()
                .with_cleartext()
                .with_service_name("OtherService"),
        ),
    )
    .unwrap();

    let (_client_tx, mut client_rx) = dialer.open(StreamKind::Stream).await.unwrap().split();
    match recv(&mut client_rx).await {
        Err(TransportError::Status(status)) => assert_eq!(status.code, Code::Unimplemented),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_streams_share_one_connection() {
    let (listener, dialer) = cleartext_pair().await;

    let first = dialer.open(StreamKind::Stream).await.unwrap();
    let second = dialer.open(StreamKind::Datagram).await.unwrap();
    assert_ne!(first.stream_id(), second.stream_id());

    let (mut first_tx, _first_rx) = first.split();
    let (mut second_tx, _second_rx) = second.split();
    first_tx.send(Hunk::new(&b"1"[..])).await.unwrap();
    second_tx.send(Hunk::new(&b"2"[..])).await.unwrap();

    let a = accept(&listener).await;
    let b = accept(&listener).await;
    assert_eq!(a.peer, b.peer);
}

#[tokio::test]
async fn test_tls_round_trip_with_self_signed_cert() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = GrpcListener::bind(
        bind_addr,
        Arc::new(GrpcConfig::server_with_identity(vec![cert_der.clone()], key_der)),
    )
    .await
    .unwrap();

    let dialer = GrpcDialer::new(
        listener.local_addr().to_string(),
        Arc::new(
            GrpcConfig::client_default()
                .with_server_name("localhost")
                .with_root_cert(cert_der),
        ),
    )
    .unwrap();

    let (mut client_tx, mut client_rx) = timeout(TEST_TIMEOUT, dialer.open(StreamKind::Stream))
        .await
        .expect("Open timeout")
        .expect("Open failed")
        .split();
    client_tx.send(Hunk::new(&b"secret"[..])).await.unwrap();

    let call = accept(&listener).await;
    let (mut server_tx, mut server_rx) = call.stream.split();
    assert_eq!(recv(&mut server_rx).await.unwrap().unwrap().data, &b"secret"[..]);

    server_tx.send(Hunk::new(&b"ack"[..])).await.unwrap();
    assert_eq!(recv(&mut client_rx).await.unwrap().unwrap().data, &b"ack"[..]);
}

#[tokio::test]
async fn test_untrusted_certificate_is_rejected() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = GrpcListener::bind(
        bind_addr,
        Arc::new(GrpcConfig::server_with_identity(
            vec![certified.cert.der().clone()],
            key_der,
        )),
    )
    .await
    .unwrap();

    let dialer = GrpcDialer::new(
        listener.local_addr().to_string(),
        Arc::new(GrpcConfig::client_default().with_server_name("localhost")),
    )
    .unwrap();

    let result = timeout(TEST_TIMEOUT, dialer.open(StreamKind::Stream))
        .await
        .expect("Open timeout");
    assert!(matches!(result, Err(TransportError::TlsError(_))));
}

#[tokio::test]
async fn test_shutdown_ends_accept() {
    let (listener, _dialer) = cleartext_pair().await;
    listener.shutdown();

    let next = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("Accept timeout")
        .unwrap();
    assert!(next.is_none());
}
