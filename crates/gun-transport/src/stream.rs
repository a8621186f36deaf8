//! gRPC stream implementation

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use gun_proto::{Code, GrpcCodec, Hunk, Status};
use h2::client::ResponseFuture;
use h2::{Reason, RecvStream, SendStream};
use http::{HeaderMap, HeaderValue};
use std::task::Poll;
use tracing::trace;

use crate::error::{TransportError, TransportResult};
use crate::{TunnelRecv, TunnelSend, TunnelStream};

pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";

/// Which end of the call this stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// One gRPC bidi-streaming call
pub struct GrpcStream {
    sender: GrpcSender,
    receiver: GrpcReceiver,
}

impl std::fmt::Debug for GrpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcStream")
            .field("stream_id", &self.sender.stream_id)
            .field("role", &self.sender.role)
            .finish()
    }
}

impl GrpcStream {
    pub(crate) fn client(send: SendStream<Bytes>, response: ResponseFuture) -> Self {
        let stream_id = send.stream_id().as_u32() as u64;
        Self {
            sender: GrpcSender::new(send, Role::Client, stream_id),
            receiver: GrpcReceiver::new(RecvState::Pending(response), stream_id),
        }
    }

    pub(crate) fn server(send: SendStream<Bytes>, body: RecvStream) -> Self {
        let stream_id = send.stream_id().as_u32() as u64;
        Self {
            sender: GrpcSender::new(send, Role::Server, stream_id),
            receiver: GrpcReceiver::new(RecvState::Streaming(body), stream_id),
        }
    }
}

impl TunnelStream for GrpcStream {
    type Sender = GrpcSender;
    type Receiver = GrpcReceiver;

    fn stream_id(&self) -> u64 {
        self.sender.stream_id
    }

    fn split(self) -> (GrpcSender, GrpcReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a gRPC call
pub struct GrpcSender {
    send: SendStream<Bytes>,
    role: Role,
    stream_id: u64,
    closed: bool,
}

impl std::fmt::Debug for GrpcSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcSender")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl GrpcSender {
    fn new(send: SendStream<Bytes>, role: Role, stream_id: u64) -> Self {
        Self {
            send,
            role,
            stream_id,
            closed: false,
        }
    }

    /// Write a whole frame, waiting for HTTP/2 flow-control capacity
    async fn write_frame(&mut self, mut data: Bytes) -> TransportResult<()> {
        while !data.is_empty() {
            self.send.reserve_capacity(data.len());

            let capacity = match poll_fn(|cx| self.send.poll_capacity(cx)).await {
                Some(Ok(0)) => continue,
                Some(Ok(n)) => n,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(self.closed_reason().await),
            };

            let chunk = data.split_to(capacity.min(data.len()));
            self.send.send_data(chunk, false)?;
        }
        Ok(())
    }

    /// Explain why the send side can no longer stream
    async fn closed_reason(&mut self) -> TransportError {
        let reset = poll_fn(|cx| match self.send.poll_reset(cx) {
            Poll::Ready(Ok(reason)) => Poll::Ready(Some(reason)),
            _ => Poll::Ready(None),
        })
        .await;

        match reset {
            Some(reason) => TransportError::Reset(reason),
            None => TransportError::StreamClosed,
        }
    }

    fn status_trailers(status: &Status) -> HeaderMap {
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from(status.code.as_u32()));
        if !status.message.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&encode_grpc_message(&status.message)) {
                trailers.insert(GRPC_MESSAGE, value);
            }
        }
        trailers
    }
}

#[async_trait]
impl TunnelSend for GrpcSender {
    async fn send(&mut self, hunk: Hunk) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let frame = GrpcCodec::encode(&hunk)?;
        self.write_frame(frame).await?;

        trace!("Sent {} bytes on gRPC stream {}", hunk.len(), self.stream_id);
        Ok(())
    }

    async fn close_send(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.role {
            // Empty DATA frame with END_STREAM
            Role::Client => self.send.send_data(Bytes::new(), true)?,
            Role::Server => self
                .send
                .send_trailers(Self::status_trailers(&Status::ok()))?,
        }

        trace!("Half-closed gRPC stream {}", self.stream_id);
        Ok(())
    }

    async fn abort(&mut self, status: Status) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.role {
            Role::Client => self.send.send_reset(Reason::CANCEL),
            Role::Server => self.send.send_trailers(Self::status_trailers(&status))?,
        }

        trace!("Aborted gRPC stream {} with {}", self.stream_id, status);
        Ok(())
    }
}

pub(crate) enum RecvState {
    /// Client waiting for response headers
    Pending(ResponseFuture),
    Streaming(RecvStream),
    Done,
}

/// Receiving half of a gRPC call
pub struct GrpcReceiver {
    state: RecvState,
    buffer: BytesMut,
    stream_id: u64,
}

impl std::fmt::Debug for GrpcReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcReceiver")
            .field("stream_id", &self.stream_id)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl GrpcReceiver {
    fn new(state: RecvState, stream_id: u64) -> Self {
        Self {
            state,
            buffer: BytesMut::with_capacity(8192),
            stream_id,
        }
    }

    fn on_response(response: http::Response<RecvStream>) -> TransportResult<RecvState> {
        if response.status() != http::StatusCode::OK {
            return Err(TransportError::ProtocolError(format!(
                "Server returned HTTP {}",
                response.status()
            )));
        }

        // Trailers-only response: the call ended before any message
        if let Some(status) = status_from_headers(response.headers()) {
            return if status.is_ok() {
                Ok(RecvState::Done)
            } else {
                Err(TransportError::Status(status))
            };
        }

        Ok(RecvState::Streaming(response.into_body()))
    }
}

#[async_trait]
impl TunnelRecv for GrpcReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Hunk>> {
        loop {
            if let Some(hunk) = GrpcCodec::decode(&mut self.buffer)? {
                trace!(
                    "Received {} bytes on gRPC stream {}",
                    hunk.len(),
                    self.stream_id
                );
                return Ok(Some(hunk));
            }

            match &mut self.state {
                RecvState::Pending(response) => {
                    let response = response.await;
                    self.state = RecvState::Done;
                    self.state = Self::on_response(response?)?;
                }
                RecvState::Streaming(body) => match body.data().await {
                    Some(Ok(data)) => {
                        // Release flow control capacity
                        let _ = body.flow_control().release_capacity(data.len());
                        self.buffer.extend_from_slice(&data);
                    }
                    Some(Err(e)) => {
                        self.state = RecvState::Done;
                        return Err(e.into());
                    }
                    None => {
                        let trailers = body.trailers().await;
                        self.state = RecvState::Done;

                        if !self.buffer.is_empty() {
                            return Err(TransportError::ProtocolError(
                                "Stream ended inside a message".to_string(),
                            ));
                        }

                        if let Some(trailers) = trailers? {
                            if let Some(status) = status_from_headers(&trailers) {
                                if !status.is_ok() {
                                    return Err(TransportError::Status(status));
                                }
                            }
                        }
                        return Ok(None);
                    }
                },
                RecvState::Done => return Ok(None),
            }
        }
    }
}

/// Read `grpc-status` / `grpc-message` from headers or trailers
pub(crate) fn status_from_headers(headers: &HeaderMap) -> Option<Status> {
    let code = headers.get(GRPC_STATUS)?;
    let message = headers
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .map(decode_grpc_message)
        .unwrap_or_default();
    Some(Status::new(Code::from_header(code.as_bytes()), message))
}

/// Percent-encode a status message as gRPC requires
pub(crate) fn encode_grpc_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..0x7f).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_grpc_message(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |b: u8| (b as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_message_encoding() {
        assert_eq!(encode_grpc_message("dial failed"), "dial failed");
        assert_eq!(encode_grpc_message("50%\n"), "50%25%0A");
        assert_eq!(decode_grpc_message("50%25%0A"), "50%\n");
        assert_eq!(decode_grpc_message("trailing %"), "trailing %");
    }

    #[test]
    fn test_status_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(status_from_headers(&headers).is_none());

        headers.insert(GRPC_STATUS, HeaderValue::from_static("14"));
        headers.insert(GRPC_MESSAGE, HeaderValue::from_static("connection%20refused"));
        let status = status_from_headers(&headers).unwrap();
        assert_eq!(status.code, Code::Unavailable);
        assert_eq!(status.message, "connection refused");
    }
}
