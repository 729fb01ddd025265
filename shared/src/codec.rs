//! Length-prefixed codec for TCP framing
//!
//! All messages are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: JSON payload ]
//! ```
//!
//! This keeps message boundaries intact over a byte stream. The codec does not
//! look inside the payload; callers serialize and parse JSON themselves.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Maximum message size (10 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Invalid message length prefix: {0}")]
    InvalidLength(u32),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame a raw payload into a length-prefixed byte buffer
pub fn encode(payload: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Frame a raw payload directly into a provided buffer
pub fn encode_into(payload: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }

    buf.reserve(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    Ok(())
}

/// Serialize a value as JSON and frame it
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(value)?;
    encode(&payload)
}

/// Try to decode a length-prefixed payload from a buffer
///
/// Returns:
/// - `Ok(Some(payload))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the length prefix is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

    if msg_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(msg_len));
    }

    let total_len = 4 + msg_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(msg_len as usize).freeze()))
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeartbeatSample;

    #[test]
    fn test_length_prefix_matches_payload() {
        let encoded = encode(br#"{"commands":"uptime"}"#).expect("encode failed");

        let len_prefix = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len_prefix as usize, encoded.len() - 4);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode(&mut buf).expect("decode failed").expect("no message");
        assert_eq!(&decoded[..], br#"{"commands":"uptime"}"#);
        assert!(buf.is_empty(), "buffer should be empty after decode");
    }

    #[test]
    fn test_partial_decode() {
        let encoded = encode(b"partial payload").expect("encode failed");

        let mut buf = BytesMut::from(&encoded[..5]);
        let result = decode(&mut buf).expect("decode should not fail on partial data");
        assert!(result.is_none(), "should return None for partial data");

        // Data not consumed
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_frame_decoder_across_chunks() {
        let sample = HeartbeatSample {
            cpu_usage: 12.3,
            memory_usage: 45.6,
        };
        let encoded = encode_json(&sample).expect("encode failed");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&encoded[..3]);
        assert!(decoder.decode_next().expect("decode error").is_none());

        decoder.extend(&encoded[3..]);
        let payload = decoder
            .decode_next()
            .expect("decode error")
            .expect("should have message");

        let decoded: HeartbeatSample = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, sample);
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode(b"first").unwrap());
        decoder.extend(&encode(b"second").unwrap());

        assert_eq!(&decoder.decode_next().unwrap().unwrap()[..], b"first");
        assert_eq!(&decoder.decode_next().unwrap().unwrap()[..], b"second");
        assert!(decoder.decode_next().expect("decode error").is_none());
    }

    #[test]
    fn test_empty_payload_is_a_frame() {
        let mut buf = BytesMut::from(&encode(b"").unwrap()[..]);
        let decoded = decode(&mut buf).unwrap().expect("empty frame");
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_message_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE + 1);
        buf.put_bytes(0, 100);

        let result = decode(&mut buf);
        assert!(matches!(result, Err(CodecError::InvalidLength(_))));
    }
}
