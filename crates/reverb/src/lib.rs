//! # Reverb
//!
//! Server-authoritative object replication over TCP.
//!
//! A [`ReverbServer`] owns a registry of replicated objects and broadcasts
//! a snapshot of all of them on a fixed tick. Each [`ReverbClient`] keeps
//! mirrors of those objects, creating them on first sight, and can ask the
//! server to run a named method on any of them. Everything else on the
//! wire is a named event routed to user handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reverb::prelude::*;
//!
//! struct Pawn {
//!     state: ObjectState,
//! }
//!
//! impl Replicate for Pawn {
//!     const TYPE_NAME: &'static str = "Pawn";
//!
//!     fn state(&self) -> &ObjectState { &self.state }
//!     fn state_mut(&mut self) -> &mut ObjectState { &mut self.state }
//!     fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
//!         Ok(Self { state })
//!     }
//!     fn register_methods(methods: &mut MethodTable<Self>) {
//!         methods.method("turn", |pawn: &mut Pawn, (facing,): (Facing,)| {
//!             pawn.state.facing = facing;
//!             Ok(())
//!         });
//!     }
//! }
//!
//! # async fn run() -> Result<(), ReverbError> {
//! let server = ReverbServer::builder().bind("127.0.0.1:0").build();
//! let addr = server.start().await?;
//! let id = server.create_object(Pawn { state: ObjectState::default() })?;
//!
//! let client = ReverbClient::default();
//! client.register_type::<Pawn>();
//! client.connect(&addr.to_string()).await?;
//! // ...once a snapshot has arrived:
//! client.invoke_on_server(&id, "turn", &("E",))?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod handler;
pub mod invoke;
pub mod router;
mod server;
pub mod sync;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use client::{ClientConfig, ReverbClient};
pub use error::ReverbError;
pub use router::{EventContext, EventRouter, HandlerError, HandlerResult};
pub use server::{ReverbServer, ReverbServerBuilder, ServerConfig};
pub use sync::SyncReport;

pub use reverb_object as object;
pub use reverb_protocol as protocol;
pub use reverb_tick::TickConfig;
pub use reverb_transport::ConnectionLimits;

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        ClientConfig, ConnectionLimits, EventContext, HandlerResult, ReverbClient, ReverbError,
        ReverbServer, ReverbServerBuilder, ServerConfig, SyncReport, TickConfig,
    };
    pub use reverb_object::{
        MethodTable, ObjectError, ObjectState, Replicate, ReplicatedObject, Side,
    };
    pub use reverb_protocol::{Facing, ObjectId, Position, events};
}

// Poisoning is ignored: panics in handlers are caught by the router.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
