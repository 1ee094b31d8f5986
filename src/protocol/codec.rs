//! Frame encoding and decoding.
//!
//! Wire layout:
//!
//! ```text
//! +--------+----------------- variant-specific body ------------------+
//! | type:1 |                                                          |
//! +--------+----------------------------------------------------------+
//! ```
//!
//! A heartbeat body is empty. Message and error bodies are:
//!
//! ```text
//! +--------+------------------+----------+----------------------+
//! | hlen:1 | headers_b64:hlen | size:4   | payload_b64:size     |
//! +--------+------------------+----------+----------------------+
//! ```
//!
//! Multi-byte integers are big-endian. Base64 uses the standard alphabet
//! with padding. The outer `size` field duplicates `headers.Size` so a
//! decoder can resync a damaged stream; the two must agree.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Payload, PayloadHeaders, ProtocolError, MAX_PAYLOAD_SIZE, TAG_ERROR, TAG_HEARTBEAT,
    TAG_MESSAGE,
};

/// Codec turning a byte stream into [`Payload`] frames and back.
#[derive(Debug, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        PayloadCodec
    }
}

impl Decoder for PayloadCodec {
    type Item = Payload;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Payload>, ProtocolError> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };

        match tag {
            TAG_HEARTBEAT => {
                src.advance(1);
                Ok(Some(Payload::HeartBeat))
            }
            TAG_MESSAGE | TAG_ERROR => decode_framed(tag, src),
            _ => Err(ProtocolError::UnknownType),
        }
    }
}

impl Encoder<Payload> for PayloadCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Payload, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let tag = item.tag();
        match item {
            Payload::HeartBeat => {
                dst.put_u8(tag);
                Ok(())
            }
            Payload::Message(m) => encode_framed(tag, &serde_json::to_vec(&m)?, dst),
            Payload::Error(e) => encode_framed(tag, e.as_bytes(), dst),
        }
    }
}

/// Decode a message or error frame.
///
/// Returns `Ok(None)` until the whole frame is buffered; consumes exactly
/// one frame on success. The size ceiling is enforced before the body
/// buffer is grown.
fn decode_framed(tag: u8, src: &mut BytesMut) -> Result<Option<Payload>, ProtocolError> {
    if src.len() < 2 {
        return Ok(None);
    }

    let hlen = src[1] as usize;
    let body_start = 2 + hlen + 4;
    if src.len() < body_start {
        src.reserve(body_start - src.len());
        return Ok(None);
    }

    let headers = decode_headers(&src[2..2 + hlen])?;
    if headers.size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MaxPayloadSize);
    }

    let off = 2 + hlen;
    let declared = u32::from_be_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]);
    if declared > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MaxPayloadSize);
    }
    if declared != headers.size {
        return Err(ProtocolError::SizeMismatch);
    }

    let frame_len = body_start + declared as usize;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    let raw = BASE64.decode(&src[body_start..frame_len])?;
    let payload = match tag {
        TAG_MESSAGE => Payload::Message(serde_json::from_slice(&raw)?),
        _ => Payload::Error(String::from_utf8(raw)?),
    };

    src.advance(frame_len);
    Ok(Some(payload))
}

fn decode_headers(blob: &[u8]) -> Result<PayloadHeaders, ProtocolError> {
    let json = BASE64
        .decode(blob)
        .map_err(|_| ProtocolError::EmptyHeaders)?;
    serde_json::from_slice(&json).map_err(|_| ProtocolError::EmptyHeaders)
}

fn encode_framed(tag: u8, raw: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = BASE64.encode(raw);
    if body.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::MaxPayloadSize);
    }

    let headers = PayloadHeaders {
        size: body.len() as u32,
        tag,
        encoding: String::new(),
    };
    let headers_b64 = BASE64.encode(serde_json::to_vec(&headers)?);

    dst.reserve(2 + headers_b64.len() + 4 + body.len());
    dst.put_u8(tag);
    dst.put_u8(headers_b64.len() as u8);
    dst.put_slice(headers_b64.as_bytes());
    dst.put_u32(body.len() as u32);
    dst.put_slice(body.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;

    fn sample_message() -> Payload {
        Payload::Message(ChatMessage {
            message: "This some cool communication protocol".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
        })
    }

    /// Handcraft a message frame with the given header size and outer size.
    fn craft_frame(header_size: u32, outer_size: u32) -> BytesMut {
        let headers = PayloadHeaders {
            size: header_size,
            tag: TAG_MESSAGE,
            encoding: String::new(),
        };
        let headers_b64 = BASE64.encode(serde_json::to_vec(&headers).unwrap());

        let mut buf = BytesMut::new();
        buf.put_u8(TAG_MESSAGE);
        buf.put_u8(headers_b64.len() as u8);
        buf.put_slice(headers_b64.as_bytes());
        buf.put_u32(outer_size);
        buf
    }

    #[test]
    fn test_message_round_trip() {
        let payload = sample_message();

        let mut buf = BytesMut::new();
        PayloadCodec::new().encode(payload.clone(), &mut buf).unwrap();

        let decoded = PayloadCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_round_trip() {
        let payload = Payload::Error("chat does not exist".to_string());

        let mut buf = BytesMut::new();
        PayloadCodec::new().encode(payload.clone(), &mut buf).unwrap();

        let decoded = PayloadCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_heartbeat_is_one_byte() {
        let mut buf = BytesMut::new();
        PayloadCodec::new().encode(Payload::HeartBeat, &mut buf).unwrap();

        assert_eq!(&buf[..], &[TAG_HEARTBEAT]);

        let decoded = PayloadCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Payload::HeartBeat);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_boundary() {
        let first = sample_message();
        let second = Payload::Error("boom".to_string());

        let mut codec = PayloadCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(Payload::HeartBeat, &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Payload::HeartBeat);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let mut full = BytesMut::new();
        PayloadCodec::new().encode(sample_message(), &mut full).unwrap();

        let mut codec = PayloadCodec::new();
        let mut buf = BytesMut::new();

        // Feed the frame a few bytes at a time; only the last chunk yields.
        let chunks: Vec<_> = full.chunks(7).collect();
        for chunk in &chunks[..chunks.len() - 1] {
            buf.extend_from_slice(chunk);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(chunks[chunks.len() - 1]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_message());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_tag() {
        for tag in [0u8, 255] {
            let mut buf = BytesMut::from(&[tag, 0, 0, 0][..]);
            match PayloadCodec::new().decode(&mut buf) {
                Err(ProtocolError::UnknownType) => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_size_ceiling() {
        let oversize = MAX_PAYLOAD_SIZE + 1;
        let mut buf = craft_frame(oversize, oversize);

        match PayloadCodec::new().decode(&mut buf) {
            Err(ProtocolError::MaxPayloadSize) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_size_mismatch() {
        let mut buf = craft_frame(8, 9);

        match PayloadCodec::new().decode(&mut buf) {
            Err(ProtocolError::SizeMismatch) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_headers() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_MESSAGE);
        buf.put_u8(4);
        buf.put_slice(b"!!!!");
        buf.put_u32(0);

        match PayloadCodec::new().decode(&mut buf) {
            Err(ProtocolError::EmptyHeaders) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_buffer() {
        let mut buf = BytesMut::new();
        assert!(PayloadCodec::new().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encoder_refuses_oversize() {
        let payload = Payload::Error("x".repeat(MAX_PAYLOAD_SIZE as usize));

        let mut buf = BytesMut::new();
        match PayloadCodec::new().encode(payload, &mut buf) {
            Err(ProtocolError::MaxPayloadSize) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
