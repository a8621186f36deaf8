//! Server UDP engine: one ephemeral socket per datagram call

use bytes::Bytes;
use gun_proto::Hunk;
use gun_transport::{TunnelRecv, TunnelSend, TunnelStream};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::{RelayError, RelayResult};
use crate::session::{Session, SessionTable};

/// Relay one datagram call to `remote` until it ends or is evicted
pub(crate) async fn relay_datagram_call<S: TunnelStream>(
    stream: S,
    client: SocketAddr,
    remote: SocketAddr,
    sessions: Arc<SessionTable>,
    shutdown: CancellationToken,
) {
    let (mut sender, mut receiver) = stream.split();

    let socket = match bind_ephemeral(remote).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to bind UDP socket for {}: {}", client, e);
            let _ = sender.abort(e.status()).await;
            return;
        }
    };

    let key = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let e = RelayError::from(e);
            let _ = sender.abort(e.status()).await;
            return;
        }
    };

    let session = Arc::new(Session::new(
        sessions.next_id(),
        key,
        shutdown.child_token(),
        None,
    ));
    sessions.insert(session.clone());
    session.touch();
    debug!(
        "UDP session {} for {} relaying {} <-> {}",
        session.id(),
        client,
        key,
        remote
    );

    let result = tokio::select! {
        _ = session.closed() => Ok(()),
        result = uplink(&mut receiver, &socket, remote, &session) => result,
        result = downlink(&socket, remote, &mut sender, &session) => result,
    };

    sessions.remove_if_same(&key, session.id());
    session.close();

    match result {
        Ok(()) => {
            debug!("UDP session {} for {} closed", session.id(), client);
            let _ = sender.close_send().await;
        }
        Err(e) if e.is_benign() => {
            debug!("UDP session {} for {} ended: {}", session.id(), client, e);
            let _ = sender.close_send().await;
        }
        Err(e) => {
            warn!("UDP session {} for {} failed: {}", session.id(), client, e);
            let _ = sender.abort(e.status()).await;
        }
    }
}

async fn bind_ephemeral(remote: SocketAddr) -> RelayResult<UdpSocket> {
    let bind_addr: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    Ok(UdpSocket::bind(bind_addr).await?)
}

/// Tunnel -> remote. Ends cleanly when the client ends the stream.
async fn uplink<T: TunnelRecv>(
    receiver: &mut T,
    socket: &UdpSocket,
    remote: SocketAddr,
    session: &Session,
) -> RelayResult<()> {
    while let Some(hunk) = receiver.recv().await? {
        socket.send_to(&hunk.data, remote).await?;
        session.touch();
    }
    Ok(())
}

/// Remote -> tunnel. Only datagrams from the remote address are forwarded.
async fn downlink<T: TunnelSend>(
    socket: &UdpSocket,
    remote: SocketAddr,
    sender: &mut T,
    session: &Session,
) -> RelayResult<()> {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, from) = socket.recv_from(&mut buffer).await?;
        if from != remote {
            trace!("Discarding {} byte datagram from {}", n, from);
            continue;
        }

        sender
            .send(Hunk::new(Bytes::copy_from_slice(&buffer[..n])))
            .await?;
        session.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gun_transport::memory;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn echo_peer() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_relays_and_filters_sources() {
        let (remote, remote_addr) = echo_peer().await;
        let sessions = Arc::new(SessionTable::new());
        let (tunnel, client) = memory::pair();

        let task = tokio::spawn(relay_datagram_call(
            tunnel,
            SocketAddr::from(([127, 0, 0, 1], 1)),
            remote_addr,
            sessions.clone(),
            CancellationToken::new(),
        ));

        let (mut client_tx, mut client_rx) = client.split();
        client_tx.send(Hunk::new(&b"query"[..])).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, relay_addr) = timeout(Duration::from_secs(5), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(sessions.len(), 1);

        // A stranger writing to the relay socket is ignored
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"spoofed", relay_addr).await.unwrap();
        remote.send_to(b"answer", relay_addr).await.unwrap();

        let hunk = timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(hunk.data, &b"answer"[..]);

        // Client end of stream ends the session and the call
        client_tx.close_send().await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(sessions.is_empty());
        assert!(client_rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_ends_call() {
        let (_remote, remote_addr) = echo_peer().await;
        let sessions = Arc::new(SessionTable::new());
        let (tunnel, client) = memory::pair();

        let task = tokio::spawn(relay_datagram_call(
            tunnel,
            SocketAddr::from(([127, 0, 0, 1], 1)),
            remote_addr,
            sessions.clone(),
            CancellationToken::new(),
        ));

        let (_client_tx, mut client_rx) = client.split();
        while sessions.is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sessions.evict_idle(Duration::ZERO), 1);

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(client_rx.recv().await.unwrap().is_none());
    }
}
