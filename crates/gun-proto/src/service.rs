//! gRPC service and method naming
//!
//! The tunnel exposes one service with two bidi-streaming methods:
//! `Tun` carries a byte stream (TCP), `TunDatagram` carries datagrams (UDP).

use std::fmt;

/// Default gRPC service name
pub const DEFAULT_SERVICE_NAME: &str = "GunService";

const TUN_METHOD: &str = "Tun";
const TUN_DATAGRAM_METHOD: &str = "TunDatagram";

/// Kind of tunnel carried by one stream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Byte-stream tunnel with TCP semantics
    Stream,
    /// Datagram tunnel with UDP semantics, one call per NAT association
    Datagram,
}

impl StreamKind {
    pub fn method(&self) -> &'static str {
        match self {
            StreamKind::Stream => TUN_METHOD,
            StreamKind::Datagram => TUN_DATAGRAM_METHOD,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stream => write!(f, "tcp"),
            StreamKind::Datagram => write!(f, "udp"),
        }
    }
}

/// Request paths for a given service name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    stream: String,
    datagram: String,
}

impl ServicePaths {
    /// Build paths for `service_name`.
    ///
    /// Leading and trailing slashes are ignored, so `"GunService"` and
    /// `"/GunService/"` are equivalent. An empty name falls back to the default.
    pub fn new(service_name: &str) -> Self {
        let trimmed = service_name.trim_matches('/');
        let service = if trimmed.is_empty() {
            DEFAULT_SERVICE_NAME
        } else {
            trimmed
        };

        Self {
            stream: format!("/{}/{}", service, TUN_METHOD),
            datagram: format!("/{}/{}", service, TUN_DATAGRAM_METHOD),
        }
    }

    pub fn path(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Stream => &self.stream,
            StreamKind::Datagram => &self.datagram,
        }
    }

    /// Map a request path back to the stream kind it serves
    pub fn kind_of(&self, path: &str) -> Option<StreamKind> {
        if path == self.stream {
            Some(StreamKind::Stream)
        } else if path == self.datagram {
            Some(StreamKind::Datagram)
        } else {
            None
        }
    }
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}
