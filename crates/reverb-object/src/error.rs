//! Error types for the object layer.

use reverb_protocol::ObjectId;

use crate::Side;

/// Errors raised by objects, registries and method dispatch.
///
/// The first group are contract violations (the caller did something the
/// registries forbid) and are always returned to the caller. The second
/// group describes a remote request or snapshot record that can't be
/// honoured; the synchronizer and invoker log those and carry on.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    // -- Registry invariants --
    /// Another object already lives under this id.
    #[error("object id {0} is already registered")]
    DuplicateId(ObjectId),

    /// The object has not been given an id yet (it was never registered).
    #[error("object has no id yet; register it first")]
    UnassignedId,

    /// Ids are assigned once; this object already has one.
    #[error("object already has id {0}; ids are assigned once")]
    IdAlreadyAssigned(ObjectId),

    /// The operation is only valid on the other side.
    #[error("{operation} is not allowed on the {side} side")]
    WrongSide {
        operation: &'static str,
        side: Side,
    },

    /// An extra-state value could not be converted to JSON.
    #[error("extra state value #{index} is not JSON-serializable: {source}")]
    NotSerializable {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    // -- Lookups from wire data --
    /// No factory is registered under this type name.
    #[error("type {0:?} is not registered")]
    TypeNotRegistered(String),

    /// An object was addressed as one variant but is another.
    #[error("expected a {expected} object, found a {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// No object lives under this id.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// The variant's method table has no entry for this name.
    #[error("type {type_name} has no method {method:?}")]
    MethodNotFound { type_name: String, method: String },

    /// The arguments didn't decode into what the method expects.
    #[error("bad arguments for {method}: {reason}")]
    BadArguments { method: String, reason: String },

    /// The method ran and refused the call.
    #[error("{method} failed: {reason}")]
    MethodFailed { method: String, reason: String },

    /// A snapshot record could not be applied.
    #[error("invalid sync record for {id}: {reason}")]
    InvalidRecord { id: ObjectId, reason: String },
}
