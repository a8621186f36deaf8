//! Server side of the gRPC channel

use async_trait::async_trait;
use bytes::Bytes;
use gun_proto::{Code, ServicePaths, Status};
use h2::server::SendResponse;
use h2::RecvStream;
use http::{HeaderValue, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GrpcConfig;
use crate::error::{TransportError, TransportResult};
use crate::stream::{encode_grpc_message, GrpcStream, GRPC_MESSAGE, GRPC_STATUS};
use crate::{IncomingCall, TunnelAcceptor};

const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Calls accepted but not yet picked up by the relay
const INCOMING_QUEUE: usize = 1024;

/// Shared by every connection task of one listener
struct ServeContext {
    config: Arc<GrpcConfig>,
    paths: ServicePaths,
    incoming: mpsc::Sender<IncomingCall<GrpcStream>>,
    shutdown: CancellationToken,
}

/// Accepts gRPC tunnel calls over HTTP/2
pub struct GrpcListener {
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<IncomingCall<GrpcStream>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for GrpcListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl GrpcListener {
    /// Bind `bind_addr` and start serving
    pub async fn bind(bind_addr: SocketAddr, config: Arc<GrpcConfig>) -> TransportResult<Self> {
        // Create TCP listener synchronously using std
        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            TransportError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            TransportError::ConfigurationError(format!("Failed to set nonblocking: {}", e))
        })?;

        let tcp_listener = TcpListener::from_std(std_listener).map_err(TransportError::IoError)?;
        Self::serve(tcp_listener, config)
    }

    /// Serve gRPC on an already bound listener
    pub fn serve(tcp_listener: TcpListener, config: Arc<GrpcConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tls_acceptor = if config.is_cleartext() {
            None
        } else {
            Some(config.build_tls_acceptor()?)
        };

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        let shutdown = CancellationToken::new();

        let ctx = Arc::new(ServeContext {
            paths: config.service_paths(),
            config,
            incoming: tx,
            shutdown: shutdown.clone(),
        });

        info!(
            "gRPC listener bound to {} ({}, service paths {} / {})",
            local_addr,
            if tls_acceptor.is_some() { "tls" } else { "cleartext" },
            ctx.paths.path(gun_proto::StreamKind::Stream),
            ctx.paths.path(gun_proto::StreamKind::Datagram),
        );

        tokio::spawn(accept_loop(tcp_listener, tls_acceptor, ctx));

        Ok(Self {
            local_addr,
            incoming: Mutex::new(rx),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and send GOAWAY on open ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for GrpcListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TunnelAcceptor for GrpcListener {
    type Stream = GrpcStream;

    async fn accept(&self) -> TransportResult<Option<IncomingCall<GrpcStream>>> {
        Ok(self.incoming.lock().await.recv().await)
    }
}

async fn accept_loop(
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    ctx: Arc<ServeContext>,
) {
    loop {
        let (tcp_stream, peer) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = tcp_listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        debug!("Incoming TCP connection from {}", peer);
        let _ = tcp_stream.set_nodelay(true);

        let tls_acceptor = tls_acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(tcp_stream).await {
                    Ok(tls_stream) => {
                        debug!("TLS handshake complete from {}", peer);
                        serve_connection(tls_stream, peer, ctx).await
                    }
                    Err(e) => {
                        warn!("TLS handshake failed from {}: {}", peer, e);
                        return;
                    }
                },
                None => serve_connection(tcp_stream, peer, ctx).await,
            };

            if let Err(e) = result {
                debug!("HTTP/2 connection from {} ended: {}", peer, e);
            }
        });
    }

    debug!("gRPC accept loop stopped");
}

async fn serve_connection<T>(io: T, peer: SocketAddr, ctx: Arc<ServeContext>) -> TransportResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = h2::server::Builder::new()
        .initial_window_size(ctx.config.initial_window_size)
        .initial_connection_window_size(ctx.config.initial_connection_window_size)
        .max_concurrent_streams(ctx.config.max_concurrent_streams)
        .max_frame_size(ctx.config.max_frame_size)
        .handshake::<_, Bytes>(io)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

    info!("HTTP/2 connection established from {}", peer);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                conn.graceful_shutdown();
                // Keep driving the connection so open streams can finish
                while let Some(next) = conn.accept().await {
                    if let Ok((_, mut respond)) = next {
                        respond.send_reset(h2::Reason::REFUSED_STREAM);
                    }
                }
                return Ok(());
            }
            next = conn.accept() => match next {
                Some(Ok((request, respond))) => handle_request(request, respond, peer, &ctx),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!("HTTP/2 connection from {} closed", peer);
                    return Ok(());
                }
            },
        }
    }
}

/// Validate one request and queue it as a tunnel call
fn handle_request(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    peer: SocketAddr,
    ctx: &ServeContext,
) {
    let (parts, body) = request.into_parts();

    if parts.method != http::Method::POST {
        debug!("Rejecting {} {} from {}", parts.method, parts.uri.path(), peer);
        reply_http(&mut respond, StatusCode::METHOD_NOT_ALLOWED);
        return;
    }

    let is_grpc = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(GRPC_CONTENT_TYPE));
    if !is_grpc {
        debug!("Rejecting non-gRPC request from {}", peer);
        reply_http(&mut respond, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        return;
    }

    let path = parts.uri.path();
    let Some(kind) = ctx.paths.kind_of(path) else {
        debug!("Unknown method {} from {}", path, peer);
        let status = Status::new(Code::Unimplemented, format!("unknown method {}", path));
        reply_status(&mut respond, &status);
        return;
    };

    let permit = match ctx.incoming.try_reserve() {
        Ok(permit) => permit,
        Err(mpsc::error::TrySendError::Full(())) => {
            warn!("Too many pending calls, refusing call from {}", peer);
            let status = Status::new(Code::ResourceExhausted, "too many pending calls");
            reply_status(&mut respond, &status);
            return;
        }
        Err(mpsc::error::TrySendError::Closed(())) => {
            let status = Status::new(Code::Unavailable, "server shutting down");
            reply_status(&mut respond, &status);
            return;
        }
    };

    let response = grpc_response();
    let send = match respond.send_response(response, false) {
        Ok(send) => send,
        Err(e) => {
            debug!("Failed to answer call from {}: {}", peer, e);
            return;
        }
    };

    let stream = GrpcStream::server(send, body);
    debug!("Accepted {} call {:?} from {}", kind, stream, peer);

    permit.send(IncomingCall { kind, peer, stream });
}

fn grpc_response() -> Response<()> {
    let mut response = Response::new(());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(GRPC_CONTENT_TYPE),
    );
    response
}

fn reply_http(respond: &mut SendResponse<Bytes>, status: StatusCode) {
    let mut response = Response::new(());
    *response.status_mut() = status;
    let _ = respond.send_response(response, true);
}

/// Trailers-only response: status in the headers, no body
fn reply_status(respond: &mut SendResponse<Bytes>, status: &Status) {
    let mut response = grpc_response();
    let headers = response.headers_mut();
    headers.insert(GRPC_STATUS, HeaderValue::from(status.code.as_u32()));
    if let Ok(message) = HeaderValue::from_str(&encode_grpc_message(&status.message)) {
        headers.insert(GRPC_MESSAGE, message);
    }
    let _ = respond.send_response(response, true);
}
