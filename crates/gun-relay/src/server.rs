//! Server engine
//!
//! Takes tunnel calls from an acceptor and forwards each to the one remote
//! endpoint: TCP calls to a fresh TCP connection, datagram calls through a
//! fresh ephemeral UDP socket.

use gun_proto::{Code, Status, StreamKind};
use gun_transport::{IncomingCall, TunnelAcceptor, TunnelSend, TunnelStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::reaper::spawn_reaper;
use crate::session::SessionTable;
use crate::tcp::{relay_tcp, ConnectionTracker};
use crate::udp_server::relay_datagram_call;
use crate::RelayHandle;

pub struct Server<A> {
    acceptor: A,
    remote: SocketAddr,
    config: RelayConfig,
    connections: ConnectionTracker,
    sessions: Arc<SessionTable>,
    shutdown: CancellationToken,
}

impl<A> std::fmt::Debug for Server<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("remote", &self.remote)
            .field("config", &self.config)
            .finish()
    }
}

impl<A: TunnelAcceptor> Server<A> {
    /// Create a server forwarding to `remote` (`host:port`), resolved once here
    pub async fn new(acceptor: A, remote: &str, config: RelayConfig) -> RelayResult<Self> {
        let resolved = tokio::net::lookup_host(remote)
            .await
            .map_err(|e| RelayError::ResolveError {
                address: remote.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| RelayError::ResolveError {
                address: remote.to_string(),
                reason: "no addresses found".to_string(),
            })?;

        info!("Server forwarding to {} ({})", remote, resolved);
        Ok(Self::with_remote(acceptor, resolved, config))
    }

    pub fn with_remote(acceptor: A, remote: SocketAddr, config: RelayConfig) -> Self {
        Self {
            acceptor,
            remote,
            config,
            connections: ConnectionTracker::new(),
            sessions: Arc::new(SessionTable::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle::new(
            self.shutdown.clone(),
            self.connections.clone(),
            self.sessions.clone(),
        )
    }

    /// Serve calls until the handle is shut down or the acceptor closes
    pub async fn run(self) -> RelayResult<()> {
        let reaper = spawn_reaper(
            self.sessions.clone(),
            self.config.udp_timeout,
            self.config.reap_interval,
            self.shutdown.clone(),
        );

        loop {
            let call = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.acceptor.accept() => match accepted {
                    Ok(Some(call)) => call,
                    Ok(None) => {
                        debug!("Acceptor closed");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to accept tunnel call: {}", e);
                        continue;
                    }
                },
            };

            self.dispatch(call);
        }

        self.shutdown.cancel();
        self.sessions.close_all();
        let _ = reaper.await;
        info!(
            active_connections = self.connections.active(),
            "Server stopped"
        );
        Ok(())
    }

    fn dispatch(&self, call: IncomingCall<A::Stream>) {
        let IncomingCall { kind, peer, stream } = call;
        debug!(peer = %peer, stream_id = stream.stream_id(), "Tunnel call ({})", kind);

        match kind {
            StreamKind::Stream => {
                let remote = self.remote;
                let connections = self.connections.clone();
                let buffer_size = self.config.tcp_buffer_size;
                tokio::spawn(async move {
                    let _guard = connections.track();
                    if let Err(e) = forward_tcp(stream, peer, remote, buffer_size).await {
                        if e.is_benign() {
                            debug!(peer = %peer, "TCP relay ended: {}", e);
                        } else {
                            warn!(peer = %peer, "TCP relay failed: {}", e);
                        }
                    }
                });
            }
            StreamKind::Datagram => {
                tokio::spawn(relay_datagram_call(
                    stream,
                    peer,
                    self.remote,
                    self.sessions.clone(),
                    self.shutdown.clone(),
                ));
            }
        }
    }
}

async fn forward_tcp<S: TunnelStream>(
    stream: S,
    peer: SocketAddr,
    remote: SocketAddr,
    buffer_size: usize,
) -> RelayResult<()> {
    let remote_stream = match TcpStream::connect(remote).await {
        Ok(remote_stream) => remote_stream,
        Err(e) => {
            warn!(peer = %peer, "Failed to connect to {}: {}", remote, e);
            let (mut sender, _receiver) = stream.split();
            let status = Status::new(Code::Unavailable, format!("dial {}: {}", remote, e));
            let _ = sender.abort(status).await;
            return Ok(());
        }
    };
    let _ = remote_stream.set_nodelay(true);

    let stream_id = stream.stream_id();
    let stats = relay_tcp(remote_stream, stream, buffer_size).await?;
    debug!(
        peer = %peer,
        stream_id,
        bytes_to_remote = stats.downlink_bytes,
        bytes_to_tunnel = stats.uplink_bytes,
        "TCP forward completed"
    );
    Ok(())
}
