//! Frame codec: MessagePack serialization plus optional zlib payload
//! compression.
//!
//! The codec frames `(header, payload)` pairs, it never interprets the
//! payload; the channel and the dispatcher apply the message schema.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use crate::error::CodecError;
use crate::proto::{read_varint32, write_varint32, RpcHeader, MAX_FRAME_LEN};

/// Payloads at or below this size are never compressed, the overhead
/// outweighs the savings.
pub const COMPRESS_MIN_LEN: usize = 100;

/// Serialize a message to MessagePack (named-map encoding).
pub fn encode_msg<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    match rmp_serde::encode::to_vec_named(msg) {
        Ok(buf) => Ok(buf),
        Err(e) => {
            error!("encode error: {:?}", e);
            Err(CodecError::Encode)
        }
    }
}

/// Parse a message from MessagePack bytes.
pub fn decode_msg<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    match rmp_serde::decode::from_slice::<T>(buf) {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!("decode error: {:?}", e);
            Err(CodecError::Decode)
        }
    }
}

#[derive(Default)]
pub struct XrpcCodec();

impl XrpcCodec {
    /// Frame a header and message into `varint32(header_len) || header || payload`.
    ///
    /// When the caller requested compression and it pays off, the payload is
    /// zlib-deflated and `compressed` stays set; otherwise the flag is
    /// cleared and the raw serialization is emitted. `args_size` always
    /// reflects the final payload length.
    pub fn encode<T: Serialize>(&self, header: &RpcHeader, msg: &T) -> Result<Vec<u8>, CodecError> {
        let payload = encode_msg(msg)?;
        self.encode_raw(header, &payload)
    }

    /// Same as [encode](Self::encode) for an already-serialized payload.
    pub fn encode_raw(&self, header: &RpcHeader, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut header = header.clone();
        let mut payload = std::borrow::Cow::Borrowed(payload);
        if header.compressed && payload.len() > COMPRESS_MIN_LEN {
            let packed = compress(&payload)?;
            if packed.len() < payload.len() {
                debug!("compressed payload from {} to {} bytes", payload.len(), packed.len());
                payload = std::borrow::Cow::Owned(packed);
            } else {
                header.compressed = false;
            }
        } else {
            header.compressed = false;
        }
        header.args_size = payload.len() as u32;

        let header_buf = encode_msg(&header)?;
        let mut out = Vec::with_capacity(5 + header_buf.len() + payload.len());
        write_varint32(&mut out, header_buf.len() as u32);
        out.extend_from_slice(&header_buf);
        out.extend_from_slice(&payload);
        if out.len() > MAX_FRAME_LEN {
            return Err(CodecError::Oversize(out.len()));
        }
        Ok(out)
    }

    /// Unframe one frame into its header and raw (decompressed) payload.
    pub fn decode(&self, data: &[u8]) -> Result<(RpcHeader, Vec<u8>), CodecError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(CodecError::Oversize(data.len()));
        }
        let (header_len, prefix_len) = read_varint32(data)?.ok_or(CodecError::Truncated)?;
        let header_len = header_len as usize;
        if header_len == 0 {
            return Err(CodecError::EmptyHeader);
        }
        if header_len > data.len() - prefix_len {
            return Err(CodecError::Truncated);
        }
        let header: RpcHeader = decode_msg(&data[prefix_len..prefix_len + header_len])?;
        let rest = &data[prefix_len + header_len..];
        let args_size = header.args_size as usize;
        if args_size > rest.len() {
            return Err(CodecError::Truncated);
        }
        let mut payload = rest[..args_size].to_vec();
        if header.compressed {
            payload = decompress(&payload)?;
        }
        Ok((header, payload))
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).map_err(CodecError::Zlib)?;
    encoder.finish().map_err(CodecError::Zlib)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut decoder = ZlibDecoder::new(data).take(MAX_FRAME_LEN as u64 + 1);
    decoder.read_to_end(&mut out).map_err(CodecError::Zlib)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(CodecError::Oversize(out.len()));
    }
    Ok(out)
}
