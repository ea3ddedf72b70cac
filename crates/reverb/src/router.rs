//! Named-event dispatch.
//!
//! Every decoded packet, and every local lifecycle event (`connection`,
//! `disconnection`), is delivered through an [`EventRouter`]. Handlers run
//! on the endpoint's dispatch task, one event at a time, in registration
//! order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use reverb_protocol::PacketCodec;
use reverb_transport::ConnectionHandle;
use serde::Serialize;
use serde_json::Value;

use crate::ReverbError;

/// Error type handlers may return. Any `std::error::Error` converts into
/// it with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What an event handler returns.
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&EventContext, &Value) -> HandlerResult + Send + Sync>;

/// What a handler knows about the event it is handling.
#[derive(Debug, Clone)]
pub struct EventContext {
    connection: Option<ConnectionHandle>,
    codec: PacketCodec,
}

impl EventContext {
    /// A context for an event that arrived on (or concerns) `connection`.
    pub fn new(connection: ConnectionHandle, codec: PacketCodec) -> Self {
        Self {
            connection: Some(connection),
            codec,
        }
    }

    /// A context with no connection, for events raised locally.
    pub fn detached(codec: PacketCodec) -> Self {
        Self {
            connection: None,
            codec,
        }
    }

    /// The connection the event came from, if any.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(ConnectionHandle::peer_addr)
    }

    /// Sends an event back over the originating connection.
    ///
    /// # Errors
    /// [`ReverbError::NotConnected`] for a detached context, otherwise
    /// encode or send failures.
    pub fn reply<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<(), ReverbError> {
        let connection = self.connection.as_ref().ok_or(ReverbError::NotConnected)?;
        let frame = self.codec.encode(event, payload)?;
        connection.send(frame)?;
        Ok(())
    }
}

/// Event name → ordered list of handlers.
///
/// Cheap to clone; clones share the same table. Handlers are copied out
/// of the table before they run, so a handler may register further
/// handlers without deadlocking.
#[derive(Clone, Default)]
pub struct EventRouter {
    handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("events", &self.event_names())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler for `event`. The same handler may be added more
    /// than once; each registration fires.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&EventContext, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Runs every handler of `event` in registration order and returns how
    /// many ran.
    ///
    /// A handler that returns `Err` or panics is logged and skipped; the
    /// rest still run.
    pub fn trigger(&self, event: &str, ctx: &EventContext, payload: &Value) -> usize {
        let handlers: Vec<Handler> = {
            let table = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            table.get(event).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            tracing::warn!(event, peer = ?ctx.peer_addr(), "no handler registered for event");
            return 0;
        }

        for (index, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event, index, error = %e, "event handler failed");
                }
                Err(panic) => {
                    tracing::error!(
                        event,
                        index,
                        panic = panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        tracing::trace!(event, handlers = handlers.len(), "event dispatched");
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        let table = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        table.get(event).map_or(0, Vec::len)
    }

    /// Every event name with at least one handler, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let table = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
