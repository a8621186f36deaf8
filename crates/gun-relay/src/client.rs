//! Client engine
//!
//! Listens for TCP and UDP on the same local address and carries every
//! connection and every UDP peer over its own tunnel stream.

use gun_proto::StreamKind;
use gun_transport::{TunnelDialer, TunnelStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::reaper::spawn_reaper;
use crate::session::SessionTable;
use crate::tcp::{relay_tcp, ConnectionTracker};
use crate::udp_client::UdpClient;
use crate::RelayHandle;

pub struct Client<D> {
    tcp_listener: TcpListener,
    udp_socket: Arc<UdpSocket>,
    dialer: Arc<D>,
    config: RelayConfig,
    connections: ConnectionTracker,
    sessions: Arc<SessionTable>,
    shutdown: CancellationToken,
}

impl<D> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.tcp_listener.local_addr().ok())
            .field("config", &self.config)
            .finish()
    }
}

impl<D: TunnelDialer> Client<D> {
    /// Bind TCP and UDP on `local_addr`.
    ///
    /// With port 0 the UDP socket takes the port the TCP listener was given.
    pub async fn bind(local_addr: SocketAddr, dialer: Arc<D>, config: RelayConfig) -> RelayResult<Self> {
        let tcp_listener = TcpListener::bind(local_addr)
            .await
            .map_err(|e| bind_error(local_addr, e))?;
        let bound = tcp_listener.local_addr()?;

        let udp_socket = UdpSocket::bind(bound)
            .await
            .map_err(|e| bind_error(bound, e))?;

        info!("Client listening on {} (tcp+udp)", bound);

        Ok(Self {
            tcp_listener,
            udp_socket: Arc::new(udp_socket),
            dialer,
            config,
            connections: ConnectionTracker::new(),
            sessions: Arc::new(SessionTable::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle::new(
            self.shutdown.clone(),
            self.connections.clone(),
            self.sessions.clone(),
        )
    }

    /// Serve until the handle is shut down
    pub async fn run(self) -> RelayResult<()> {
        let reaper = spawn_reaper(
            self.sessions.clone(),
            self.config.udp_timeout,
            self.config.reap_interval,
            self.shutdown.clone(),
        );

        let udp = Arc::new(UdpClient::new(
            self.udp_socket.clone(),
            self.dialer.clone(),
            self.sessions.clone(),
            self.config.udp_queue_depth,
            self.shutdown.clone(),
        ));
        let udp_task = tokio::spawn(udp.run());

        loop {
            let (tcp_stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.tcp_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "Accepted TCP connection");

            let dialer = self.dialer.clone();
            let connections = self.connections.clone();
            let buffer_size = self.config.tcp_buffer_size;
            tokio::spawn(async move {
                let _guard = connections.track();
                if let Err(e) = handle_connection(tcp_stream, peer_addr, dialer, buffer_size).await {
                    if e.is_benign() {
                        debug!(peer = %peer_addr, "TCP relay ended: {}", e);
                    } else {
                        warn!(peer = %peer_addr, "TCP relay failed: {}", e);
                    }
                }
            });
        }

        let _ = udp_task.await;
        let _ = reaper.await;
        info!(
            active_connections = self.connections.active(),
            "Client stopped"
        );
        Ok(())
    }
}

async fn handle_connection<D: TunnelDialer>(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    dialer: Arc<D>,
    buffer_size: usize,
) -> RelayResult<()> {
    let _ = tcp_stream.set_nodelay(true);

    let stream = dialer.open(StreamKind::Stream).await?;
    let stream_id = stream.stream_id();
    debug!(peer = %peer_addr, stream_id, "Opened TCP tunnel");

    let stats = relay_tcp(tcp_stream, stream, buffer_size).await?;
    debug!(
        peer = %peer_addr,
        stream_id,
        bytes_up = stats.uplink_bytes,
        bytes_down = stats.downlink_bytes,
        "TCP connection closed"
    );
    Ok(())
}

fn bind_error(addr: SocketAddr, e: std::io::Error) -> RelayError {
    RelayError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    }
}
