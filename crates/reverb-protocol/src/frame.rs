//! Frame reassembly for byte streams.
//!
//! A single `read()` on a TCP socket may return half a frame, exactly one,
//! or several glued together. [`FrameDecoder`] buffers whatever arrives and
//! hands back complete frame bodies, in order, as soon as they are whole.

use crate::{LENGTH_PREFIX_LEN, ProtocolError};

/// Accumulates raw bytes and splits them into frame bodies.
///
/// ```rust
/// use reverb_protocol::PacketCodec;
///
/// let codec = PacketCodec::default();
/// let frame = codec.encode("tick", &1).unwrap();
///
/// let mut decoder = codec.decoder();
/// decoder.extend(&frame[..3]);
/// assert!(decoder.next_frame().unwrap().is_none());
///
/// decoder.extend(&frame[3..]);
/// let body = decoder.next_frame().unwrap().unwrap();
/// assert_eq!(codec.decode(&body).unwrap().name, "tick");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Creates an empty decoder that rejects bodies above `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Appends freshly read bytes to the buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame body, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Call in a loop after
    /// every [`extend`](Self::extend) until it returns `None`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FrameTooLarge`] as soon as a prefix
    /// announces an oversized body. The decoder can't recover from this;
    /// the connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some(prefix) = self.buf.get(..LENGTH_PREFIX_LEN) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let end = LENGTH_PREFIX_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let body = self.buf[LENGTH_PREFIX_LEN..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(body))
    }

    /// Number of bytes buffered but not yet returned as a frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacketCodec;
    use serde_json::json;

    /// Three frames of different sizes, concatenated.
    fn stream() -> (PacketCodec, Vec<u8>, Vec<String>) {
        let codec = PacketCodec::default();
        let names = vec!["first".to_string(), "second".into(), "third".into()];
        let mut bytes = Vec::new();
        bytes.extend(codec.encode(&names[0], &json!(null)).unwrap());
        bytes.extend(codec.encode(&names[1], &json!({"k": [1, 2, 3]})).unwrap());
        bytes.extend(codec.encode(&names[2], &json!("x".repeat(40))).unwrap());
        (codec, bytes, names)
    }

    fn drain(codec: &PacketCodec, decoder: &mut FrameDecoder) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(body) = decoder.next_frame().unwrap() {
            out.push(codec.decode(&body).unwrap().name);
        }
        out
    }

    #[test]
    fn test_next_frame_empty_buffer_returns_none() {
        let mut decoder = FrameDecoder::new(1024);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_next_frame_whole_stream_yields_all_in_order() {
        let (codec, bytes, names) = stream();
        let mut decoder = codec.decoder();
        decoder.extend(&bytes);
        assert_eq!(drain(&codec, &mut decoder), names);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_next_frame_byte_at_a_time() {
        let (codec, bytes, names) = stream();
        let mut decoder = codec.decoder();
        let mut seen = Vec::new();
        for byte in &bytes {
            decoder.extend(std::slice::from_ref(byte));
            seen.extend(drain(&codec, &mut decoder));
        }
        assert_eq!(seen, names);
    }

    #[test]
    fn test_next_frame_every_pair_of_split_points() {
        // Cut the stream into three chunks at every possible (i, j),
        // including cuts inside prefixes and bodies.
        let (codec, bytes, names) = stream();
        for i in 0..=bytes.len() {
            for j in i..=bytes.len() {
                let mut decoder = codec.decoder();
                let mut seen = Vec::new();
                for chunk in [&bytes[..i], &bytes[i..j], &bytes[j..]] {
                    decoder.extend(chunk);
                    seen.extend(drain(&codec, &mut decoder));
                }
                assert_eq!(seen, names, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn test_next_frame_keeps_trailing_partial_frame() {
        let (codec, bytes, _) = stream();
        let mut decoder = codec.decoder();
        decoder.extend(&bytes[..bytes.len() - 1]);
        assert_eq!(drain(&codec, &mut decoder).len(), 2);
        assert!(decoder.buffered_len() > 0);
    }

    #[test]
    fn test_next_frame_oversized_prefix_is_error() {
        let mut decoder = FrameDecoder::new(8);
        decoder.extend(&100u32.to_be_bytes());
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { len: 100, max: 8 }));
    }

    #[test]
    fn test_next_frame_malformed_body_still_framed() {
        // Garbage inside a well-formed frame is the codec's problem, not
        // the decoder's: the next frame must still come out intact.
        let codec = PacketCodec::default();
        let mut decoder = codec.decoder();
        let garbage = b"{oops";
        decoder.extend(&(garbage.len() as u32).to_be_bytes());
        decoder.extend(garbage);
        decoder.extend(&codec.encode("after", &1).unwrap());

        let first = decoder.next_frame().unwrap().unwrap();
        assert!(codec.decode(&first).is_err());
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(codec.decode(&second).unwrap().name, "after");
    }
}
