//! Tunnel Protocol Definitions
//!
//! Wire types shared by both ends of the tunnel: the `Hunk` payload message,
//! gRPC length-prefixed framing, service paths and status codes.

pub mod codec;
pub mod messages;
pub mod service;
pub mod status;

pub use codec::{CodecError, GrpcCodec};
pub use messages::Hunk;
pub use service::{ServicePaths, StreamKind, DEFAULT_SERVICE_NAME};
pub use status::{Code, Status};

/// Largest protobuf message accepted in a single gRPC frame (4 MiB, the gRPC default)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Size of the gRPC frame prefix (1 byte compressed flag + 4 byte length)
pub const FRAME_HEADER_LEN: usize = 5;
