use std::io;

/// Stable error codes carried in the response header (`RpcHeader::status`).
///
/// The display string is the canonical wire message for the code.
#[derive(strum::Display, strum::AsRefStr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WireErr {
    #[strum(serialize = "Failed to decode request")]
    DecodeRequest = 1,
    #[strum(serialize = "Service not found")]
    ServiceNotFound = 2,
    #[strum(serialize = "Method not found")]
    MethodNotFound = 3,
    #[strum(serialize = "Failed to parse request")]
    ParseRequest = 4,
    #[strum(serialize = "Request handler failed")]
    Handler = 5,
    #[strum(serialize = "Internal server error")]
    Internal = 6,
}

impl WireErr {
    #[inline]
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

/// Canonical client-side failure messages reported through the controller.
pub const ERR_INSTANCE_NOT_FOUND: &str = "Service instance not found";
pub const ERR_SEND_ASYNC: &str = "Failed to send async request";
pub const ERR_NO_RESPONSE: &str = "No response received";
pub const ERR_DECODE_RESPONSE: &str = "Failed to decode response";
pub const ERR_CANCELLED_BEFORE_SEND: &str = "Request was canceled before sending";
pub const ERR_CANCELLED: &str = "Request was canceled";

/// Frame encode/decode failures.
///
/// `Encode` can only be produced by a serializer bug or resource exhaustion,
/// every other variant comes from malformed or truncated input.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize message")]
    Encode,
    #[error("failed to parse message")]
    Decode,
    #[error("zero-length header")]
    EmptyHeader,
    #[error("truncated frame")]
    Truncated,
    #[error("frame of {0} bytes exceeds the 64 MiB limit")]
    Oversize(usize),
    #[error("zlib error: {0}")]
    Zlib(#[source] io::Error),
}

/// Errors surfaced by the coordination service and the registry client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    #[error("node does not exist")]
    NoNode,
    #[error("node already exists")]
    NodeExists,
    #[error("node version mismatch")]
    BadVersion,
    #[error("coordination session not connected")]
    NotConnected,
    #[error("coordination session expired")]
    SessionExpired,
    #[error("coordination service error: {0}")]
    Backend(String),
}

/// Crate-level error for construction and registration paths.
///
/// Per-call failures never take this form, they are reported through
/// [XrpcController](crate::XrpcController).
#[derive(Debug, thiserror::Error)]
pub enum XrpcError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Registry(#[from] CoordError),
    #[error("invalid instance address {0:?}")]
    BadAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_err_strings() {
        assert_eq!(WireErr::ServiceNotFound.code(), 2);
        assert_eq!(WireErr::ServiceNotFound.to_string(), "Service not found");
        assert_eq!(WireErr::Handler.code(), 5);
        assert_eq!(WireErr::DecodeRequest.to_string(), "Failed to decode request");
    }

    #[test]
    fn test_error_conversion() {
        let e: XrpcError = CoordError::NoNode.into();
        match e {
            XrpcError::Registry(CoordError::NoNode) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
