//! Wire protocol for Reverb.
//!
//! This crate defines what travels between a Reverb server and its clients:
//!
//! - **Codec** ([`PacketCodec`]): turns a named event plus a JSON payload
//!   into one length-prefixed frame, and a frame body back into a
//!   [`Packet`].
//! - **Framing** ([`FrameDecoder`]): a TCP stream is not message-aligned,
//!   so incoming bytes are accumulated here until whole frames are
//!   available.
//! - **Types** ([`SyncRecord`], [`InvokeRequest`], ...): the payload shapes
//!   of the reserved events listed in [`events`].
//! - **Errors** ([`ProtocolError`]).
//!
//! # Frame layout
//!
//! ```text
//! ┌──────────────────┬───────────────────────────────────────────┐
//! │ u32 BE: body len │ {"name": "<event>", "contents": <JSON>}   │
//! └──────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! The protocol layer knows nothing about sockets or registries. It sits
//! between the transport (raw bytes) and the event router (named events):
//!
//! ```text
//! Transport (bytes) → Protocol (Packet) → Router (handlers)
//! ```

mod codec;
mod error;
pub mod events;
mod frame;
mod types;

pub use codec::{DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN, PacketCodec};
pub use error::ProtocolError;
pub use frame::FrameDecoder;
pub use types::{
    ClientDisconnection, Facing, InvokeRejected, InvokeRequest, ObjectId,
    Packet, Position, Snapshot, SyncRecord,
};
