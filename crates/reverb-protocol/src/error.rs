//! Error types for the protocol layer.
//!
//! A `ProtocolError` always means "these bytes could not be turned into
//! an event" (or the other way around). It never says anything about the
//! socket the bytes came from.

/// Errors that can occur while encoding, framing or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serializing an outgoing payload failed.
    ///
    /// With `serde_json` this only happens for values JSON cannot
    /// represent, such as maps with non-string keys.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// A frame body was not a valid `{"name", "contents"}` JSON object.
    ///
    /// Receivers log and drop the frame; the connection stays open
    /// because the length prefix already told us where the next frame
    /// starts.
    #[error("malformed packet: {0}")]
    MalformedPacket(serde_json::Error),

    /// A frame declared (or would need) a body larger than allowed.
    ///
    /// Unlike [`MalformedPacket`](Self::MalformedPacket) this is fatal
    /// for the connection: skipping the body would mean buffering it.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The packet decoded fine but its payload has the wrong shape for
    /// the event it was sent under.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
