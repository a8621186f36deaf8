//! gRPC status codes carried in `grpc-status` trailers

use std::fmt;

/// Status codes used by the tunnel (subset of the gRPC code space)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    Unimplemented,
    Internal,
    Unavailable,
    /// Any code this crate has no name for
    Other(u32),
}

impl Code {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            8 => Code::ResourceExhausted,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            other => Code::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Code::Ok => 0,
            Code::Cancelled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::ResourceExhausted => 8,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::Other(value) => *value,
        }
    }

    /// Parse the textual value of a `grpc-status` header.
    /// Unparseable values map to `Unknown`.
    pub fn from_header(value: &[u8]) -> Self {
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(Code::from_u32)
            .unwrap_or(Code::Unknown)
    }
}

/// A gRPC call outcome: code plus optional message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "grpc-status {:?}", self.code)
        } else {
            write!(f, "grpc-status {:?}: {}", self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parsing() {
        assert_eq!(Code::from_header(b"0"), Code::Ok);
        assert_eq!(Code::from_header(b"14"), Code::Unavailable);
        assert_eq!(Code::from_header(b"99"), Code::Other(99));
        assert_eq!(Code::from_header(b"nope"), Code::Unknown);
    }

    #[test]
    fn test_code_numbers_are_stable() {
        for value in 0..20 {
            assert_eq!(Code::from_u32(value).as_u32(), value);
        }
    }
}
