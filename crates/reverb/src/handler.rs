//! Per-connection read loop and the endpoint's dispatch task.
//!
//! Each live connection gets a task running [`read_loop`]. It turns the
//! byte stream into packets and forwards them, tagged with their
//! connection, to a single [`dispatch_loop`] per endpoint. That task is
//! the only place router handlers run, so handlers never race each other
//! and packets from one connection are handled in the order they arrived.

use reverb_protocol::{Packet, PacketCodec, ProtocolError, events};
use reverb_transport::{ConnectionHandle, ConnectionReader};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::router::{EventContext, EventRouter};

/// Size of the buffer each `read()` fills.
const READ_CHUNK: usize = 8 * 1024;

/// Work items for the dispatch task.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A connection went live: fires `connection`.
    Connected(ConnectionHandle),
    /// A packet arrived on a connection.
    Packet {
        connection: ConnectionHandle,
        packet: Packet,
    },
    /// A connection's read loop ended: fires `disconnection`.
    Disconnected(ConnectionHandle),
}

pub(crate) type InboundSender = mpsc::UnboundedSender<Inbound>;

/// Reads frames off `reader` until the stream ends, forwarding each
/// decoded packet to the dispatch task.
///
/// Returns on EOF, local close, I/O error, an oversized frame, or when
/// the dispatch task is gone. A frame that isn't a valid packet is logged
/// and dropped; the connection stays up.
pub(crate) async fn read_loop(
    mut reader: ConnectionReader,
    connection: &ConnectionHandle,
    codec: PacketCodec,
    inbound: &InboundSender,
) {
    let conn_id = connection.id();
    let peer = connection.peer_addr();
    let mut decoder = codec.decoder();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(%conn_id, %peer, "connection closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%conn_id, %peer, error = %e, "read error");
                return;
            }
        };
        decoder.extend(&buf[..n]);

        loop {
            let body = match decoder.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    // The stream can't be re-synchronised after a bad prefix.
                    tracing::warn!(%conn_id, %peer, error = %e, "dropping connection");
                    return;
                }
            };

            match codec.decode(&body) {
                Ok(packet) => {
                    tracing::trace!(%conn_id, event = %packet.name, "packet received");
                    let item = Inbound::Packet {
                        connection: connection.clone(),
                        packet,
                    };
                    if inbound.send(item).is_err() {
                        return;
                    }
                }
                Err(e @ ProtocolError::MalformedPacket(_)) => {
                    tracing::warn!(%conn_id, %peer, error = %e, "discarding malformed packet");
                }
                Err(e) => {
                    tracing::warn!(%conn_id, %peer, error = %e, "discarding undecodable frame");
                }
            }
        }
    }
}

/// Runs router handlers for everything the read loops forward, until
/// every sender is gone.
pub(crate) async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    router: EventRouter,
    codec: PacketCodec,
) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Connected(connection) => {
                let ctx = EventContext::new(connection, codec);
                router.trigger(events::CONNECTION, &ctx, &Value::Null);
            }
            Inbound::Packet { connection, packet } => {
                let ctx = EventContext::new(connection, codec);
                router.trigger(&packet.name, &ctx, &packet.contents);
            }
            Inbound::Disconnected(connection) => {
                let ctx = EventContext::new(connection, codec);
                router.trigger(events::DISCONNECTION, &ctx, &Value::Null);
            }
        }
    }
    tracing::debug!("dispatch task stopped");
}
