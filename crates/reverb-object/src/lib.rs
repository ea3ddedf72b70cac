//! Replicated objects and the registries that hold them.
//!
//! - **Objects** ([`Replicate`], [`ReplicatedObject`], [`ObjectState`]):
//!   the capability set every replicated variant implements.
//! - **Object registry** ([`ObjectRegistry`]): `id → object`, one per
//!   endpoint. Authoritative on the server, mirrors on a client.
//! - **Type registry** ([`TypeRegistry`]): `type name → constructor +
//!   method table`, so objects known only by name on the wire can be
//!   rebuilt and invoked.
//!
//! # How it fits in the stack
//!
//! ```text
//! Synchronizer / Remote Invoker (above)  ← read and mutate registries
//!     ↕
//! Object layer (this crate)              ← object identity, types, methods
//!     ↕
//! Protocol layer (below)                 ← ObjectId, SyncRecord, Facing...
//! ```
//!
//! Neither registry is thread-safe by itself. Endpoints own them behind a
//! lock, so each registry call is one short critical section.

mod error;
mod methods;
mod object;
mod registry;
mod type_registry;

pub use error::ObjectError;
pub use methods::MethodTable;
pub use object::{ObjectState, Replicate, ReplicatedObject, Side};
pub use registry::ObjectRegistry;
pub use type_registry::TypeRegistry;
