//! The packet codec: named event + JSON payload ⇄ length-prefixed frame.
//!
//! Encoding produces a complete, self-delimiting frame (prefix included)
//! ready to be written to a socket. Decoding works on a frame *body*, the
//! bytes after the prefix, as yielded by [`FrameDecoder`]. Splitting the
//! two keeps the codec free of any buffering state.

use serde::Serialize;

use crate::{FrameDecoder, Packet, ProtocolError};

/// Width of the big-endian `u32` length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame body accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Borrowed mirror of [`Packet`] so encoding never clones the payload.
#[derive(Serialize)]
struct PacketRef<'a, T: ?Sized> {
    name: &'a str,
    contents: &'a T,
}

/// Encodes and decodes Reverb packets.
///
/// The only knob is the maximum frame body size, which both sides should
/// agree on. Cheap to copy; every connection keeps its own.
///
/// ## Example
///
/// ```rust
/// use reverb_protocol::{PacketCodec, LENGTH_PREFIX_LEN};
/// use serde_json::json;
///
/// let codec = PacketCodec::default();
/// let frame = codec.encode("hello", &json!({"msg": "hi"})).unwrap();
///
/// let packet = codec.decode(&frame[LENGTH_PREFIX_LEN..]).unwrap();
/// assert_eq!(packet.name, "hello");
/// assert_eq!(packet.contents, json!({"msg": "hi"}));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_frame_len: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl PacketCodec {
    /// Creates a codec that refuses frame bodies above `max_frame_len`.
    ///
    /// The limit is capped at `u32::MAX`, the largest length the prefix
    /// can express.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    /// The configured maximum frame body size in bytes.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encodes `{"name": name, "contents": contents}` into one frame.
    ///
    /// # Errors
    /// - [`ProtocolError::Encode`] if `contents` can't be represented as
    ///   JSON.
    /// - [`ProtocolError::FrameTooLarge`] if the body exceeds the limit.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        name: &str,
        contents: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        // Reserve the prefix up front and serialize straight after it, so
        // the body is written once and never shifted.
        let mut frame = Vec::with_capacity(128);
        frame.extend_from_slice(&[0u8; LENGTH_PREFIX_LEN]);
        serde_json::to_writer(&mut frame, &PacketRef { name, contents })
            .map_err(ProtocolError::Encode)?;

        let len = frame.len() - LENGTH_PREFIX_LEN;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        // `max_frame_len` is capped at u32::MAX, so this can't truncate.
        let prefix = (len as u32).to_be_bytes();
        frame[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
        Ok(frame)
    }

    /// Decodes one frame body (prefix already stripped) into a [`Packet`].
    ///
    /// # Errors
    /// Returns [`ProtocolError::MalformedPacket`] if the body isn't UTF-8
    /// JSON, or if `name` or `contents` is missing.
    pub fn decode(&self, body: &[u8]) -> Result<Packet, ProtocolError> {
        serde_json::from_slice(body).map_err(ProtocolError::MalformedPacket)
    }

    /// Creates an empty [`FrameDecoder`] sharing this codec's size limit.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.max_frame_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn round_trip(name: &str, contents: Value) -> Packet {
        let codec = PacketCodec::default();
        let frame = codec.encode(name, &contents).expect("encode");
        codec.decode(&frame[LENGTH_PREFIX_LEN..]).expect("decode")
    }

    #[test]
    fn test_encode_prefix_is_big_endian_body_length() {
        let codec = PacketCodec::default();
        let frame = codec.encode("ping", &Value::Null).unwrap();

        let body = br#"{"name":"ping","contents":null}"#;
        assert_eq!(&frame[..LENGTH_PREFIX_LEN], &(body.len() as u32).to_be_bytes());
        assert_eq!(&frame[LENGTH_PREFIX_LEN..], body);
    }

    #[test]
    fn test_round_trip_preserves_name_and_payload() {
        let payloads = [
            Value::Null,
            json!(42),
            json!("Salut !"),
            json!([1, "two", 3.5, null]),
            json!({"msg": "hello", "nested": {"list": [true, false]}}),
        ];
        for payload in payloads {
            let packet = round_trip("hello", payload.clone());
            assert_eq!(packet.name, "hello");
            assert_eq!(packet.contents, payload);
        }
    }

    #[test]
    fn test_round_trip_unicode_event_name() {
        let packet = round_trip("événement", json!({"clé": "valeur"}));
        assert_eq!(packet.name, "événement");
        assert_eq!(packet.contents["clé"], "valeur");
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let codec = PacketCodec::default();
        let err = codec.decode(b"not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_decode_missing_name_is_malformed() {
        let codec = PacketCodec::default();
        let err = codec.decode(br#"{"contents": 1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_decode_missing_contents_is_malformed() {
        let codec = PacketCodec::default();
        let err = codec.decode(br#"{"name": "hello"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_decode_null_contents_is_accepted() {
        let codec = PacketCodec::default();
        let packet = codec.decode(br#"{"name": "server_stop", "contents": null}"#).unwrap();
        assert_eq!(packet.name, "server_stop");
        assert!(packet.contents.is_null());
    }

    #[test]
    fn test_decode_invalid_utf8_is_malformed() {
        let codec = PacketCodec::default();
        let err = codec.decode(&[0xff, 0xfe, 0xfd]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_encode_over_limit_is_frame_too_large() {
        let codec = PacketCodec::new(16);
        let err = codec.encode("big", &"x".repeat(64)).unwrap_err();
        match err {
            ProtocolError::FrameTooLarge { max, len } => {
                assert_eq!(max, 16);
                assert!(len > 16);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_non_string_map_keys_fails() {
        use std::collections::HashMap;
        let codec = PacketCodec::default();
        let mut map = HashMap::new();
        map.insert(vec![1u8], 1);
        let err = codec.encode("bad", &map).unwrap_err();
        assert!(matches!(err, ProtocolError::Encode(_)));
    }
}
