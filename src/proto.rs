//! Wire-visible request/response header and frame layout.
//!
//! One frame = `varint32(header_len) || header_bytes || payload_bytes`.
//! The header is a self-describing MessagePack map, the payload is the
//! serialized request or response message (possibly zlib-compressed, see
//! [crate::codec]). Request and response frames share the same shape.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CodecError;

/// Hard cap on a whole frame (length prefix + header + payload).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Error detail attached to a response header when `status != 0`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
}

/// Routing and framing metadata carried in front of every payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RpcHeader {
    pub service_name: String,
    pub method_name: String,
    /// Client-chosen correlation id, echoed back in the response header.
    pub request_id: u64,
    /// Byte length of the payload that follows, after compression if applied.
    pub args_size: u32,
    pub compressed: bool,
    /// Set when the caller aborted before send.
    pub cancelled: bool,
    /// 0 = success, otherwise one of the stable codes in [crate::error::WireErr].
    pub status: u32,
    pub error: Option<ErrorInfo>,
}

impl RpcHeader {
    pub fn request(service_name: &str, method_name: &str, request_id: u64, compressed: bool) -> Self {
        Self {
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            request_id,
            compressed,
            ..Default::default()
        }
    }

    /// Response header answering `request_id`, successful until marked otherwise.
    pub fn reply(request_id: u64, compressed: bool) -> Self {
        Self { request_id, compressed, ..Default::default() }
    }

    #[inline]
    pub fn set_error(&mut self, code: u32, message: String) {
        self.status = code;
        self.error = Some(ErrorInfo { code, message });
    }

    /// The error message if present, or the canonical fallback for the status.
    pub fn error_message(&self) -> String {
        match self.error.as_ref() {
            Some(e) if !e.message.is_empty() => e.message.clone(),
            _ => format!("rpc failed with status {}", self.status),
        }
    }
}

impl fmt::Display for RpcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}.{} id:{} args:{} status:{}]",
            self.service_name, self.method_name, self.request_id, self.args_size, self.status
        )
    }
}

pub(crate) fn write_varint32(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(b);
            return;
        }
        buf.push(b | 0x80);
    }
}

/// Returns `Ok(Some((value, prefix_len)))` once the varint is complete,
/// `Ok(None)` when more bytes are needed.
pub(crate) fn read_varint32(buf: &[u8]) -> Result<Option<(u32, usize)>, CodecError> {
    let mut v: u32 = 0;
    for (i, b) in buf.iter().enumerate() {
        if i >= 5 {
            return Err(CodecError::Decode);
        }
        v |= ((b & 0x7f) as u32) << (7 * i as u32);
        if b & 0x80 == 0 {
            return Ok(Some((v, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(CodecError::Decode);
    }
    Ok(None)
}

/// Scan an accumulation buffer for one complete frame.
///
/// Returns `Ok(Some(total_len))` once the length prefix and header have
/// arrived; the frame is complete when the buffer holds `total_len` bytes.
/// Returns `Ok(None)` while the prefix or header is still partial. Malformed
/// or oversize input is an error and the connection must be dropped.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    let Some((header_len, prefix_len)) = read_varint32(buf)? else {
        return Ok(None);
    };
    let header_len = header_len as usize;
    if header_len == 0 {
        return Err(CodecError::EmptyHeader);
    }
    if prefix_len + header_len > MAX_FRAME_LEN {
        return Err(CodecError::Oversize(prefix_len + header_len));
    }
    if buf.len() < prefix_len + header_len {
        return Ok(None);
    }
    let header: RpcHeader = crate::codec::decode_msg(&buf[prefix_len..prefix_len + header_len])?;
    let total = prefix_len + header_len + header.args_size as usize;
    if total > MAX_FRAME_LEN {
        return Err(CodecError::Oversize(total));
    }
    Ok(Some(total))
}
