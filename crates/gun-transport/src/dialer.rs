//! Client side of the gRPC channel
//!
//! One HTTP/2 connection is shared by every tunnel stream. It is dialed
//! lazily on the first `open` and re-dialed after it breaks, with
//! exponential backoff between failed attempts.

use async_trait::async_trait;
use bytes::Bytes;
use gun_proto::{ServicePaths, StreamKind};
use h2::client::SendRequest;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::GrpcConfig;
use crate::error::{TransportError, TransportResult};
use crate::stream::GrpcStream;
use crate::TunnelDialer;

const USER_AGENT: &str = concat!("gun-rs/", env!("CARGO_PKG_VERSION"));

/// An established HTTP/2 connection
struct Channel {
    connection_id: String,
    send_request: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
}

impl Channel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ChannelState {
    channel: Option<Channel>,
    /// Consecutive failed connection attempts
    retries: u32,
    /// Earliest time the next attempt may start
    retry_at: Option<Instant>,
}

/// Opens tunnel streams to a gRPC tunnel server
pub struct GrpcDialer {
    remote_addr: String,
    server_name: String,
    scheme: &'static str,
    tls_connector: Option<tokio_rustls::TlsConnector>,
    paths: ServicePaths,
    config: Arc<GrpcConfig>,
    state: Mutex<ChannelState>,
}

impl std::fmt::Debug for GrpcDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcDialer")
            .field("remote_addr", &self.remote_addr)
            .field("server_name", &self.server_name)
            .field("cleartext", &self.tls_connector.is_none())
            .finish()
    }
}

impl GrpcDialer {
    /// Create a dialer for `remote_addr` (`host:port`).
    ///
    /// No connection is made here; configuration and TLS setup errors are
    /// reported immediately.
    pub fn new(remote_addr: impl Into<String>, config: Arc<GrpcConfig>) -> TransportResult<Self> {
        config.validate()?;

        let remote_addr = remote_addr.into();
        let (host, _) = split_host_port(&remote_addr)?;
        let server_name = config
            .security()
            .server_name
            .clone()
            .unwrap_or_else(|| host.to_string());

        let (scheme, tls_connector) = if config.is_cleartext() {
            ("http", None)
        } else {
            ("https", Some(config.build_tls_connector()?))
        };

        debug!(
            "gRPC dialer created for {} (server name {}, {})",
            remote_addr, server_name, scheme
        );

        Ok(Self {
            remote_addr,
            server_name,
            scheme,
            tls_connector,
            paths: config.service_paths(),
            config,
            state: Mutex::new(ChannelState::default()),
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Return a usable connection, dialing a new one if needed
    async fn ready_channel(&self) -> TransportResult<SendRequest<Bytes>> {
        let mut state = self.state.lock().await;

        if let Some(channel) = &state.channel {
            if !channel.is_closed() {
                return Ok(channel.send_request.clone());
            }
            debug!("[{}] Connection closed, re-dialing", channel.connection_id);
            state.channel = None;
        }

        if let Some(retry_at) = state.retry_at {
            let now = Instant::now();
            if retry_at > now {
                return Err(TransportError::Unavailable(format!(
                    "reconnecting to {} in {:?}",
                    self.remote_addr,
                    retry_at - now
                )));
            }
        }

        match timeout(self.config.min_connect_timeout, self.connect()).await {
            Ok(Ok(channel)) => {
                state.retries = 0;
                state.retry_at = None;
                let send_request = channel.send_request.clone();
                state.channel = Some(channel);
                Ok(send_request)
            }
            result => {
                let err = match result {
                    Ok(Err(e)) => e,
                    _ => TransportError::ConnectionError(format!(
                        "Connect to {} timed out after {:?}",
                        self.remote_addr, self.config.min_connect_timeout
                    )),
                };
                let delay = self.config.backoff.delay(state.retries);
                state.retries = state.retries.saturating_add(1);
                state.retry_at = Some(Instant::now() + delay);
                warn!(
                    "Failed to connect to {} (attempt {}), next attempt in {:?}: {}",
                    self.remote_addr, state.retries, delay, err
                );
                Err(err)
            }
        }
    }

    async fn connect(&self) -> TransportResult<Channel> {
        let addr = resolve(&self.remote_addr).await?;

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let _ = tcp_stream.set_nodelay(true);

        match &self.tls_connector {
            Some(tls_connector) => {
                let dns_name = ServerName::try_from(self.server_name.clone())
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

                let tls_stream = tls_connector
                    .connect(dns_name, tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

                self.handshake(tls_stream, addr).await
            }
            None => self.handshake(tcp_stream, addr).await,
        }
    }

    async fn handshake<T>(&self, io: T, addr: SocketAddr) -> TransportResult<Channel>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("h2-client-{}", uuid::Uuid::new_v4());

        let (send_request, h2_conn) = h2::client::Builder::new()
            .initial_window_size(self.config.initial_window_size)
            .initial_connection_window_size(self.config.initial_connection_window_size)
            .max_frame_size(self.config.max_frame_size)
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));

        // Spawn connection driver
        let closed_clone = closed.clone();
        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            if let Err(e) = h2_conn.await {
                if !e.is_go_away() && !e.is_io() {
                    error!("[{}] H2 connection error: {}", conn_id, e);
                } else {
                    debug!("[{}] H2 connection ended: {}", conn_id, e);
                }
            }
            debug!("[{}] H2 connection closed", conn_id);
            closed_clone.store(true, Ordering::SeqCst);
        });

        info!(
            "gRPC channel established to {} ({}, {})",
            self.server_name, addr, connection_id
        );

        Ok(Channel {
            connection_id,
            send_request,
            closed,
        })
    }

    async fn open_call(&self, kind: StreamKind) -> TransportResult<GrpcStream> {
        let send_request = self.ready_channel().await?;

        // Wait for the connection to accept another stream
        let mut ready_request = send_request.ready().await.map_err(|e| {
            self.mark_broken();
            TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
        })?;

        let uri = format!(
            "{}://{}{}",
            self.scheme,
            self.server_name,
            self.paths.path(kind)
        );
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/grpc")
            .header(http::header::TE, "trailers")
            .header(http::header::USER_AGENT, USER_AGENT)
            .body(())
            .map_err(|e| TransportError::ProtocolError(format!("Invalid request: {}", e)))?;

        let (response, send_stream) = ready_request
            .send_request(request, false)
            .map_err(|e| TransportError::ConnectionError(format!("Failed to open stream: {}", e)))?;

        let stream = GrpcStream::client(send_stream, response);
        debug!("Opened {} stream {:?} to {}", kind, stream, self.remote_addr);
        Ok(stream)
    }

    fn mark_broken(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.channel = None;
        }
    }
}

#[async_trait]
impl TunnelDialer for GrpcDialer {
    type Stream = GrpcStream;

    async fn open(&self, kind: StreamKind) -> TransportResult<GrpcStream> {
        self.open_call(kind).await
    }
}

async fn resolve(addr: &str) -> TransportResult<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("Failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| TransportError::ConnectionError(format!("No address found for {}", addr)))
}

/// Split `host:port`, accepting bracketed IPv6 literals
pub(crate) fn split_host_port(addr: &str) -> TransportResult<(&str, u16)> {
    let invalid = || {
        TransportError::ConfigurationError(format!(
            "Invalid address '{}' (expected host:port)",
            addr
        ))
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}
