//! Unified error type for the Reverb framework.

use std::net::SocketAddr;

use reverb_object::ObjectError;
use reverb_protocol::ProtocolError;
use reverb_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// `#[from]` on each wrapped variant lets `?` convert sub-crate errors
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum ReverbError {
    /// A transport-level error (connect, send, accept).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, malformed packet, oversized frame).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An object-layer error (registry invariant, type or method lookup).
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is still live.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    /// `start` was called on a server that is running or was stopped.
    #[error("server already started")]
    AlreadyStarted,

    /// No live connection comes from this address.
    #[error("no live connection from {0}")]
    PeerNotFound(SocketAddr),
}
