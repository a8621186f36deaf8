//! Client UDP engine: one tunnel stream per local peer address

use bytes::Bytes;
use gun_proto::{Hunk, StreamKind};
use gun_transport::{TunnelDialer, TunnelRecv, TunnelSend, TunnelStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::RelayResult;
use crate::session::{Session, SessionTable};

pub(crate) struct UdpClient<D> {
    socket: Arc<UdpSocket>,
    dialer: Arc<D>,
    sessions: Arc<SessionTable>,
    queue_depth: usize,
    shutdown: CancellationToken,
}

impl<D: TunnelDialer> UdpClient<D> {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        dialer: Arc<D>,
        sessions: Arc<SessionTable>,
        queue_depth: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            socket,
            dialer,
            sessions,
            queue_depth,
            shutdown,
        }
    }

    /// Receive local datagrams until shutdown
    pub(crate) async fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (n, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            trace!("Received {} byte datagram from {}", n, peer);
            self.dispatch(peer, Bytes::copy_from_slice(&buffer[..n]));
        }

        self.sessions.close_all();
        debug!("UDP client loop stopped");
    }

    /// Queue a datagram on the peer's session, creating the session if needed
    fn dispatch(self: &Arc<Self>, peer: SocketAddr, data: Bytes) {
        let mut queue = None;
        let (session, created) = self.sessions.get_or_insert_with(peer, |id| {
            let (tx, rx) = mpsc::channel(self.queue_depth);
            queue = Some(rx);
            Session::new(id, peer, self.shutdown.child_token(), Some(tx))
        });

        if created {
            if let Some(queue) = queue {
                debug!("New UDP session {} for {}", session.id(), peer);
                tokio::spawn(self.clone().run_session(session.clone(), queue));
            }
        }

        let Some(uplink) = session.uplink() else {
            return;
        };
        match uplink.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("UDP session {} queue full, dropping datagram", session.id());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("UDP session {} closing, dropping datagram", session.id());
            }
        }
    }

    /// Own the session's stream until it ends or the session is closed
    async fn run_session(self: Arc<Self>, session: Arc<Session>, mut queue: mpsc::Receiver<Bytes>) {
        let peer = session.peer();

        let opened = tokio::select! {
            _ = session.closed() => {
                self.sessions.remove_if_same(&peer, session.id());
                return;
            }
            opened = self.dialer.open(StreamKind::Datagram) => opened,
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open UDP tunnel for {}: {}", peer, e);
                self.sessions.remove_if_same(&peer, session.id());
                session.close();
                return;
            }
        };

        debug!(
            "UDP session {} for {} using stream {}",
            session.id(),
            peer,
            stream.stream_id()
        );
        session.touch();

        let (mut sender, mut receiver) = stream.split();
        let result = tokio::select! {
            _ = session.closed() => Ok(()),
            result = uplink(&mut queue, &mut sender, &session) => result,
            result = downlink(&mut receiver, &self.socket, &session) => result,
        };

        // Entry first, so later datagrams open a new session
        self.sessions.remove_if_same(&peer, session.id());
        session.close();
        let _ = sender.close_send().await;

        match result {
            Ok(()) => debug!("UDP session {} for {} closed", session.id(), peer),
            Err(e) if e.is_benign() => {
                debug!("UDP session {} for {} ended: {}", session.id(), peer, e)
            }
            Err(e) => warn!("UDP session {} for {} failed: {}", session.id(), peer, e),
        }
    }
}

async fn uplink<T: TunnelSend>(
    queue: &mut mpsc::Receiver<Bytes>,
    sender: &mut T,
    session: &Session,
) -> RelayResult<()> {
    while let Some(data) = queue.recv().await {
        sender.send(Hunk::new(data)).await?;
        session.touch();
    }
    Ok(())
}

async fn downlink<T: TunnelRecv>(
    receiver: &mut T,
    socket: &UdpSocket,
    session: &Session,
) -> RelayResult<()> {
    while let Some(hunk) = receiver.recv().await? {
        socket.send_to(&hunk.data, session.peer()).await?;
        session.touch();
    }
    Ok(())
}
