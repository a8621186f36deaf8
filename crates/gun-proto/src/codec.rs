//! gRPC length-prefixed message framing
//!
//! Every message on the wire is preceded by a 5 byte header: a compressed
//! flag followed by the big-endian length of the protobuf payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::{Hunk, FRAME_HEADER_LEN, MAX_MESSAGE_SIZE};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Compressed gRPC messages are not supported")]
    Compressed,

    #[error("Invalid compressed flag: {0}")]
    InvalidFlag(u8),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Malformed Hunk message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Stateless encoder/decoder for framed `Hunk` messages
pub struct GrpcCodec;

impl GrpcCodec {
    /// Encode a hunk as one gRPC frame
    pub fn encode(hunk: &Hunk) -> Result<Bytes, CodecError> {
        let payload_len = hunk.encoded_len();
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: payload_len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
        buf.put_u8(0);
        buf.put_u32(payload_len as u32);
        // Capacity was reserved above, encoding cannot run out of space
        hunk.encode(&mut buf)
            .map_err(|_| CodecError::MessageTooLarge {
                size: payload_len,
                max: MAX_MESSAGE_SIZE,
            })?;

        Ok(buf.freeze())
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
    /// consumed bytes are removed from the buffer only on success.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Hunk>, CodecError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        match buf[0] {
            0 => {}
            1 => return Err(CodecError::Compressed),
            flag => return Err(CodecError::InvalidFlag(flag)),
        }

        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            buf.reserve(FRAME_HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        let hunk = Hunk::decode(payload)?;
        Ok(Some(hunk))
    }
}
