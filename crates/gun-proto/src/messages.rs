//! Protocol message types

use bytes::Bytes;

/// A chunk of raw application bytes, the only payload unit on a tunnel stream.
///
/// Wire-compatible with `message Hunk { bytes data = 1; }`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Hunk {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

impl Hunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl From<Bytes> for Hunk {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<&[u8]> for Hunk {
    fn from(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_hunk_wire_layout() {
        // field 1, wire type 2 (length-delimited), length 3
        let hunk = Hunk::new(&b"abc"[..]);
        assert_eq!(hunk.encode_to_vec(), vec![0x0a, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_empty_hunk_encodes_to_nothing() {
        let hunk = Hunk::default();
        assert!(hunk.is_empty());
        assert!(hunk.encode_to_vec().is_empty());
    }
}
