//! gRPC tunnel transport
//!
//! This crate provides the channel the relay runs on: a bidirectional stream
//! of [`Hunk`]s carried as a gRPC bidi-streaming call over HTTP/2.
//!
//! # Features
//!
//! - **Encryption**: TLS via rustls, or HTTP/2 cleartext (prior knowledge)
//! - **Multiplexing**: every tunnel stream is its own HTTP/2 stream, several
//!   streams share one connection
//! - **Reconnect**: the client channel re-dials with exponential backoff
//!
//! # Stream Mapping
//!
//! - Each tunnel stream = one gRPC call (`/<service>/Tun` or `/<service>/TunDatagram`)
//! - Hunks are sent as length-prefixed gRPC messages in DATA frames
//! - Half-close = END_STREAM (client) or `grpc-status: 0` trailers (server)

pub mod backoff;
pub mod config;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod memory;
pub mod stream;

pub use backoff::BackoffConfig;
pub use config::{GrpcConfig, SecurityConfig};
pub use dialer::GrpcDialer;
pub use error::{TransportError, TransportResult};
pub use listener::GrpcListener;
pub use stream::{GrpcReceiver, GrpcSender, GrpcStream};

pub use gun_proto::{Hunk, Status, StreamKind};

use async_trait::async_trait;
use std::net::SocketAddr;

/// Sending half of a tunnel stream
#[async_trait]
pub trait TunnelSend: Send + 'static {
    /// Send one hunk
    async fn send(&mut self, hunk: Hunk) -> TransportResult<()>;

    /// Stop sending (half-close). Idempotent.
    async fn close_send(&mut self) -> TransportResult<()>;

    /// Terminate the call with a non-OK status
    async fn abort(&mut self, status: Status) -> TransportResult<()>;
}

/// Receiving half of a tunnel stream
#[async_trait]
pub trait TunnelRecv: Send + 'static {
    /// Receive the next hunk.
    ///
    /// `Ok(None)` means the peer ended the stream gracefully. Errors may still
    /// be benign, see [`TransportError::is_benign`].
    async fn recv(&mut self) -> TransportResult<Option<Hunk>>;
}

/// A bidirectional channel of hunks owned by one TCP connection or UDP session
pub trait TunnelStream: Send + 'static {
    type Sender: TunnelSend;
    type Receiver: TunnelRecv;

    fn stream_id(&self) -> u64;

    /// Split into independently owned halves so both directions can run concurrently
    fn split(self) -> (Self::Sender, Self::Receiver);
}

/// Opens outbound tunnel streams (client side)
#[async_trait]
pub trait TunnelDialer: Send + Sync + 'static {
    type Stream: TunnelStream;

    async fn open(&self, kind: StreamKind) -> TransportResult<Self::Stream>;
}

/// An inbound stream call waiting to be relayed (server side)
pub struct IncomingCall<S> {
    pub kind: StreamKind,
    /// Address of the peer that opened the call
    pub peer: SocketAddr,
    pub stream: S,
}

impl<S> std::fmt::Debug for IncomingCall<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Accepts inbound tunnel stream calls (server side)
#[async_trait]
pub trait TunnelAcceptor: Send + Sync + 'static {
    type Stream: TunnelStream;

    /// Wait for the next call. `Ok(None)` once the acceptor has shut down.
    async fn accept(&self) -> TransportResult<Option<IncomingCall<Self::Stream>>>;
}
