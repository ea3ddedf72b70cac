//! TCP transport layer for Reverb.
//!
//! Moves opaque bytes between peers. Framing and decoding happen one layer
//! up (`reverb-protocol`); this crate only knows about sockets.
//!
//! Every connection, accepted or outbound, is split in two:
//!
//! - a [`ConnectionHandle`]: cheap to clone, used to queue outgoing frames
//!   and to close the connection from anywhere;
//! - a [`ConnectionReader`]: owned by exactly one read loop.
//!
//! Outgoing frames go through a per-connection writer task, so `send` never
//! blocks the caller and frames from one connection are written in the
//! order they were queued. [`ConnectionLimits`] bound that queue and each
//! write, so a peer that stops reading is dropped instead of piling up
//! frames forever.

mod connection;
mod error;
mod tcp;

pub use connection::{ConnectionHandle, ConnectionLimits, ConnectionReader};
pub use error::TransportError;
pub use tcp::{TcpTransport, connect, connect_with_limits};

use std::fmt;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a listening server.
    Accepted,
    /// Opened by a client with [`connect`].
    Outbound,
}
