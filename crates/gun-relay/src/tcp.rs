//! TCP relay over a tunnel stream
//!
//! Bytes read from the local socket are sent as hunks (uplink) while hunks
//! received from the stream are written back (downlink). Local EOF half-closes
//! the stream, end of stream from the peer shuts down the local write side,
//! and a hard error on either leg tears down both.

use bytes::Bytes;
use gun_proto::Hunk;
use gun_transport::{TunnelRecv, TunnelSend, TunnelStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{RelayError, RelayResult};

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Local socket -> tunnel
    pub uplink_bytes: u64,
    /// Tunnel -> local socket
    pub downlink_bytes: u64,
}

/// Counts relays in progress
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection until the guard is dropped
    pub fn track(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How the peer ended its side of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// END_STREAM or `grpc-status: 0`; the local write side is shut down
    Closed,
    /// The whole stream is gone (reset or dropped peer)
    Reset,
}

/// Relay `local` over `stream` until both directions are finished.
///
/// Returns once both legs ended cleanly, once the peer reset the stream, or
/// with the first non-benign error. On error the stream is aborted. The local
/// socket is dropped on return, which closes it.
pub async fn relay_tcp<L, S>(local: L, stream: S, buffer_size: usize) -> RelayResult<RelayStats>
where
    L: AsyncRead + AsyncWrite + Unpin,
    S: TunnelStream,
{
    let stream_id = stream.stream_id();
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut sender, mut receiver) = stream.split();
    let mut stats = RelayStats::default();

    let outcome = {
        let uplink = uplink(
            &mut local_read,
            &mut sender,
            buffer_size,
            stream_id,
            &mut stats.uplink_bytes,
        );
        let downlink = downlink(
            &mut receiver,
            &mut local_write,
            stream_id,
            &mut stats.downlink_bytes,
        );
        tokio::pin!(uplink, downlink);

        let mut uplink_done = false;
        let mut downlink_done = false;

        loop {
            tokio::select! {
                result = &mut uplink, if !uplink_done => match result {
                    Ok(()) => uplink_done = true,
                    Err(e) => break Err(e),
                },
                result = &mut downlink, if !downlink_done => match result {
                    Ok(StreamEnd::Closed) => downlink_done = true,
                    Ok(StreamEnd::Reset) => {
                        debug!("Stream {} reset, closing local connection", stream_id);
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
            }

            if uplink_done && downlink_done {
                break Ok(());
            }
        }
    };

    match outcome {
        Ok(()) => {
            debug!(
                "Relay on stream {} finished ({} bytes up, {} bytes down)",
                stream_id, stats.uplink_bytes, stats.downlink_bytes
            );
            Ok(stats)
        }
        Err(e) => {
            let _ = sender.abort(e.status()).await;
            Err(e)
        }
    }
}

/// Local socket -> tunnel. Ends with a half-close when the local read side ends.
async fn uplink<R, T>(
    local: &mut R,
    sender: &mut T,
    buffer_size: usize,
    stream_id: u64,
    total: &mut u64,
) -> RelayResult<()>
where
    R: AsyncRead + Unpin,
    T: TunnelSend,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = match local.read(&mut buffer).await {
            Ok(0) => {
                debug!("Local side closed (stream {})", stream_id);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Local read failed (stream {}): {}", stream_id, e);
                break;
            }
        };

        if let Err(e) = sender.send(Hunk::new(Bytes::copy_from_slice(&buffer[..n]))).await {
            if e.is_benign() {
                debug!("Stream {} ended by peer while sending", stream_id);
                return Ok(());
            }
            return Err(e.into());
        }

        *total += n as u64;
        trace!("Sent {} bytes to tunnel (stream {})", n, stream_id);
    }

    match sender.close_send().await {
        Err(e) if !e.is_benign() => Err(e.into()),
        _ => Ok(()),
    }
}

/// Tunnel -> local socket.
///
/// A graceful end of stream shuts down the local write side and leaves the
/// uplink running. A benign reset reports [`StreamEnd::Reset`] so the caller
/// can drop the whole connection.
async fn downlink<T, W>(
    receiver: &mut T,
    local: &mut W,
    stream_id: u64,
    total: &mut u64,
) -> RelayResult<StreamEnd>
where
    T: TunnelRecv,
    W: AsyncWrite + Unpin,
{
    loop {
        match receiver.recv().await {
            Ok(Some(hunk)) => {
                local.write_all(&hunk.data).await.map_err(RelayError::IoError)?;
                *total += hunk.len() as u64;
                trace!("Wrote {} bytes to local (stream {})", hunk.len(), stream_id);
            }
            Ok(None) => {
                debug!("Peer closed stream {}", stream_id);
                break;
            }
            Err(e) if e.is_benign() => {
                debug!("Stream {} ended by peer: {}", stream_id, e);
                let _ = local.shutdown().await;
                return Ok(StreamEnd::Reset);
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Peer may already have closed its read side
    let _ = local.shutdown().await;
    Ok(StreamEnd::Closed)
}
