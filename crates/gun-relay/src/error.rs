use gun_proto::{Code, Status};
use gun_transport::TransportError;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to resolve {address}: {reason}")]
    ResolveError { address: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RelayError {
    /// Peer-initiated termination of the tunnel stream, not a fault
    pub fn is_benign(&self) -> bool {
        matches!(self, RelayError::Transport(e) if e.is_benign())
    }

    /// Status reported to the client when this error ends a call
    pub fn status(&self) -> Status {
        let code = match self {
            RelayError::IoError(_) | RelayError::BindError { .. } => Code::Unavailable,
            RelayError::ResolveError { .. } => Code::Unavailable,
            RelayError::Transport(_) => Code::Internal,
        };
        Status::new(code, self.to_string())
    }
}
