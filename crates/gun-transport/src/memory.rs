//! In-process tunnel streams
//!
//! Streams connected by channels instead of HTTP/2. They follow the same
//! termination rules as gRPC streams (half-close, status, reset on drop), so
//! relay engines can be exercised without sockets or certificates.

use async_trait::async_trait;
use gun_proto::{Hunk, Status, StreamKind};
use h2::Reason;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};

use crate::error::{TransportError, TransportResult};
use crate::{IncomingCall, TunnelAcceptor, TunnelDialer, TunnelRecv, TunnelSend, TunnelStream};

/// Hunks in flight per direction before `send` waits
const STREAM_BUFFER: usize = 64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

enum Frame {
    Data(Hunk),
    End(Status),
}

/// Create two connected stream ends
pub fn pair() -> (MemoryStream, MemoryStream) {
    let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
    let (a_tx, a_rx) = mpsc::channel(STREAM_BUFFER);
    let (b_tx, b_rx) = mpsc::channel(STREAM_BUFFER);

    (
        MemoryStream::new(id, a_tx, b_rx),
        MemoryStream::new(id, b_tx, a_rx),
    )
}

/// One end of an in-memory tunnel stream
#[derive(Debug)]
pub struct MemoryStream {
    id: u64,
    sender: MemorySender,
    receiver: MemoryReceiver,
}

impl MemoryStream {
    fn new(id: u64, tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Self {
        Self {
            id,
            sender: MemorySender { tx, closed: false },
            receiver: MemoryReceiver { rx, done: false },
        }
    }
}

impl TunnelStream for MemoryStream {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    fn stream_id(&self) -> u64 {
        self.id
    }

    fn split(self) -> (MemorySender, MemoryReceiver) {
        (self.sender, self.receiver)
    }
}

pub struct MemorySender {
    tx: mpsc::Sender<Frame>,
    closed: bool,
}

impl std::fmt::Debug for MemorySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySender")
            .field("closed", &self.closed)
            .finish()
    }
}

impl MemorySender {
    async fn finish(&mut self, status: Status) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Peer may already be gone; ending an abandoned stream is fine
        let _ = self.tx.send(Frame::End(status)).await;
        Ok(())
    }
}

#[async_trait]
impl TunnelSend for MemorySender {
    async fn send(&mut self, hunk: Hunk) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }
        self.tx
            .send(Frame::Data(hunk))
            .await
            .map_err(|_| TransportError::Reset(Reason::CANCEL))
    }

    async fn close_send(&mut self) -> TransportResult<()> {
        self.finish(Status::ok()).await
    }

    async fn abort(&mut self, status: Status) -> TransportResult<()> {
        self.finish(status).await
    }
}

pub struct MemoryReceiver {
    rx: mpsc::Receiver<Frame>,
    done: bool,
}

impl std::fmt::Debug for MemoryReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReceiver")
            .field("done", &self.done)
            .finish()
    }
}

#[async_trait]
impl TunnelRecv for MemoryReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Hunk>> {
        if self.done {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(Frame::Data(hunk)) => Ok(Some(hunk)),
            Some(Frame::End(status)) => {
                self.done = true;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(TransportError::Status(status))
                }
            }
            // Sender dropped without ending the stream, as h2 does on drop
            None => {
                self.done = true;
                Err(TransportError::Reset(Reason::CANCEL))
            }
        }
    }
}

/// Create a connected dialer/acceptor pair
pub fn channel() -> (MemoryDialer, MemoryAcceptor) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    (
        MemoryDialer {
            calls: tx,
            peer: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            opened_streams: AtomicUsize::new(0),
            opened_datagrams: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        },
        MemoryAcceptor {
            calls: Mutex::new(rx),
        },
    )
}

/// Dialer delivering every opened stream to its [`MemoryAcceptor`]
pub struct MemoryDialer {
    calls: mpsc::Sender<IncomingCall<MemoryStream>>,
    peer: SocketAddr,
    opened_streams: AtomicUsize,
    opened_datagrams: AtomicUsize,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for MemoryDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDialer")
            .field("opened_streams", &self.opened(StreamKind::Stream))
            .field("opened_datagrams", &self.opened(StreamKind::Datagram))
            .finish()
    }
}

impl MemoryDialer {
    /// Number of streams of `kind` opened so far
    pub fn opened(&self, kind: StreamKind) -> usize {
        self.counter(kind).load(Ordering::SeqCst)
    }

    /// Make subsequent `open` calls fail as an unreachable channel would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn counter(&self, kind: StreamKind) -> &AtomicUsize {
        match kind {
            StreamKind::Stream => &self.opened_streams,
            StreamKind::Datagram => &self.opened_datagrams,
        }
    }
}

#[async_trait]
impl TunnelDialer for MemoryDialer {
    type Stream = MemoryStream;

    async fn open(&self, kind: StreamKind) -> TransportResult<MemoryStream> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("memory channel down".to_string()));
        }

        let (local, remote) = pair();
        let call = IncomingCall {
            kind,
            peer: self.peer,
            stream: remote,
        };
        self.calls
            .send(call)
            .await
            .map_err(|_| TransportError::Unavailable("acceptor closed".to_string()))?;

        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        Ok(local)
    }
}

pub struct MemoryAcceptor {
    calls: Mutex<mpsc::Receiver<IncomingCall<MemoryStream>>>,
}

impl std::fmt::Debug for MemoryAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAcceptor").finish()
    }
}

#[async_trait]
impl TunnelAcceptor for MemoryAcceptor {
    type Stream = MemoryStream;

    async fn accept(&self) -> TransportResult<Option<IncomingCall<MemoryStream>>> {
        Ok(self.calls.lock().await.recv().await)
    }
}
