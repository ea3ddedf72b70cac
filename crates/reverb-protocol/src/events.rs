//! Reserved event names.
//!
//! Applications may register handlers for any other name; these are the
//! ones the framework itself emits or consumes.

/// Local only. Fired on a client once its connection is up, and on the
/// server for every accepted peer. Payload: `null`.
pub const CONNECTION: &str = "connection";

/// Local only. Fired when a connection ends, whatever the cause.
/// Payload: `null`.
pub const DISCONNECTION: &str = "disconnection";

/// Client → server, sent by a client that is leaving on purpose.
/// Payload: [`ClientDisconnection`](crate::ClientDisconnection).
pub const CLIENT_DISCONNECTION: &str = "client_disconnection";

/// Server → all clients, once per sync tick.
/// Payload: [`Snapshot`](crate::Snapshot).
pub const SERVER_SYNC: &str = "server_sync";

/// Client → server remote invocation.
/// Payload: [`InvokeRequest`](crate::InvokeRequest).
pub const CALLING_SERVER_COMPUTING: &str = "calling_server_computing";

/// Server → one client, when its remote invocation could not run.
/// Payload: [`InvokeRejected`](crate::InvokeRejected).
pub const INVOKE_REJECTED: &str = "invoke_rejected";

/// Server → all clients, right before the server closes every
/// connection. Payload: `null`.
pub const SERVER_STOP: &str = "server_stop";
