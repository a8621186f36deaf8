//! Transport errors and the benign-termination classifier

use gun_proto::{Code, CodecError, Status};
use h2::Reason;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream reset: {0}")]
    Reset(Reason),

    #[error("Call failed with {0}")]
    Status(Status),

    #[error("HTTP/2 error: {0}")]
    H2(h2::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error only reports that the peer ended the stream.
    ///
    /// Benign: the stream already ended, a reset or GOAWAY carrying `NO_ERROR`
    /// or `CANCEL`, and calls finished with `OK` or `CANCELLED`. Everything
    /// else is a real fault on this stream.
    pub fn is_benign(&self) -> bool {
        match self {
            TransportError::StreamClosed => true,
            TransportError::Reset(reason) => {
                *reason == Reason::NO_ERROR || *reason == Reason::CANCEL
            }
            TransportError::Status(status) => {
                matches!(status.code, Code::Ok | Code::Cancelled)
            }
            _ => false,
        }
    }
}

impl From<h2::Error> for TransportError {
    fn from(err: h2::Error) -> Self {
        if err.is_io() {
            return match err.into_io() {
                Some(io) => TransportError::IoError(io),
                None => TransportError::ConnectionError("HTTP/2 I/O failure".to_string()),
            };
        }

        match err.reason() {
            Some(reason) => TransportError::Reset(reason),
            None => TransportError::H2(err),
        }
    }
}

impl From<Status> for TransportError {
    fn from(status: Status) -> Self {
        TransportError::Status(status)
    }
}
