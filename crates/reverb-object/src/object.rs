//! The replicated-object capability set.
//!
//! A concrete variant (a pawn, a door, a projectile...) embeds an
//! [`ObjectState`] and implements [`Replicate`]. The blanket impl of
//! [`ReplicatedObject`] then makes it usable behind `dyn` inside the
//! registries, where objects of many variants live side by side.

use std::any::Any;
use std::fmt;

use reverb_protocol::{Facing, ObjectId, Position, SyncRecord};
use serde::Serialize;
use serde_json::Value;

use crate::{MethodTable, ObjectError};

/// Which end of the connection a registry (or a call) lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Owns the authoritative objects and assigns ids.
    Server,
    /// Holds mirrors, rebuilt and updated from snapshots.
    Client,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Core fields every replicated object carries.
///
/// `position` and `facing` travel in every snapshot. The extra state is
/// the variant's own payload, stored as JSON so a mirror can be rebuilt
/// without knowing the concrete type up front.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectState {
    id: Option<ObjectId>,
    pub position: Position,
    pub facing: Facing,
    extra: Vec<Value>,
}

impl ObjectState {
    pub fn new(position: Position, facing: Facing) -> Self {
        Self {
            id: None,
            position,
            facing,
            extra: Vec::new(),
        }
    }

    /// Attaches extra state, converting each value to JSON.
    ///
    /// # Errors
    /// Returns [`ObjectError::NotSerializable`] for the first value that
    /// can't be represented as JSON.
    pub fn with_extra<I, T>(mut self, values: I) -> Result<Self, ObjectError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        self.set_extra(values)?;
        Ok(self)
    }

    /// Replaces the extra state. Same conversion rules as
    /// [`with_extra`](Self::with_extra).
    pub fn set_extra<I, T>(&mut self, values: I) -> Result<(), ObjectError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let extra = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::to_value(value)
                    .map_err(|source| ObjectError::NotSerializable { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.extra = extra;
        Ok(())
    }

    /// The id, once the object has been registered (server) or adopted
    /// from a snapshot (client).
    pub fn id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    /// Gives the object its id. Ids never change after this.
    ///
    /// # Errors
    /// Returns [`ObjectError::IdAlreadyAssigned`] on a second call.
    pub fn assign_id(&mut self, id: ObjectId) -> Result<(), ObjectError> {
        if let Some(existing) = &self.id {
            return Err(ObjectError::IdAlreadyAssigned(existing.clone()));
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn extra_state(&self) -> &[Value] {
        &self.extra
    }

    fn replace_extra(&mut self, extra: Vec<Value>) {
        self.extra = extra;
    }
}

/// Implemented by each concrete replicated variant.
///
/// ```ignore
/// struct Pawn { state: ObjectState }
///
/// impl Replicate for Pawn {
///     const TYPE_NAME: &'static str = "Pawn";
///
///     fn state(&self) -> &ObjectState { &self.state }
///     fn state_mut(&mut self) -> &mut ObjectState { &mut self.state }
///     fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
///         Ok(Self { state })
///     }
///     fn register_methods(methods: &mut MethodTable<Self>) {
///         methods.method("move", |pawn: &mut Pawn, (dir,): (String,)| {
///             pawn.walk(&dir)
///         });
///     }
/// }
/// ```
pub trait Replicate: Send + Sync + Sized + 'static {
    /// Name this variant is known by on the wire. Must be unique among
    /// the types registered on an endpoint.
    const TYPE_NAME: &'static str;

    fn state(&self) -> &ObjectState;

    fn state_mut(&mut self) -> &mut ObjectState;

    /// Rebuilds an instance from a snapshot record's fields. Called on a
    /// client when it first hears of an object.
    fn from_state(state: ObjectState) -> Result<Self, ObjectError>;

    /// Hook run after a sync stored new extra state, to refresh any
    /// typed fields derived from it.
    fn on_extra_state_synced(&mut self) -> Result<(), ObjectError> {
        Ok(())
    }

    /// Declares the methods a client may invoke remotely.
    fn register_methods(_methods: &mut MethodTable<Self>) {}
}

/// Object-safe view of a [`Replicate`] type, as stored in the registries.
///
/// Implemented for every `T: Replicate`; never implement it by hand.
pub trait ReplicatedObject: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    fn id(&self) -> Option<&ObjectId>;

    /// Like [`id`](Self::id), but an unregistered object is an error.
    fn require_id(&self) -> Result<&ObjectId, ObjectError> {
        self.id().ok_or(ObjectError::UnassignedId)
    }

    fn assign_id(&mut self, id: ObjectId) -> Result<(), ObjectError>;

    fn position(&self) -> Position;

    fn facing(&self) -> Facing;

    fn extra_state(&self) -> &[Value];

    /// The record this object contributes to a snapshot.
    fn pack(&self) -> SyncRecord {
        SyncRecord {
            type_name: self.type_name().to_string(),
            position: self.position(),
            facing: self.facing(),
            extra: self.extra_state().to_vec(),
        }
    }

    /// Overwrites the core fields from a snapshot. Extra state is only
    /// replaced (and the variant's hook run) when the record carries any.
    ///
    /// # Errors
    /// Returns [`ObjectError::WrongSide`] on the server: the server's
    /// objects are the source of truth and are never synced into.
    fn sync(
        &mut self,
        side: Side,
        position: Position,
        facing: Facing,
        extra: Vec<Value>,
    ) -> Result<(), ObjectError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Replicate> ReplicatedObject for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn id(&self) -> Option<&ObjectId> {
        self.state().id()
    }

    fn assign_id(&mut self, id: ObjectId) -> Result<(), ObjectError> {
        self.state_mut().assign_id(id)
    }

    fn position(&self) -> Position {
        self.state().position
    }

    fn facing(&self) -> Facing {
        self.state().facing
    }

    fn extra_state(&self) -> &[Value] {
        self.state().extra_state()
    }

    fn sync(
        &mut self,
        side: Side,
        position: Position,
        facing: Facing,
        extra: Vec<Value>,
    ) -> Result<(), ObjectError> {
        if side != Side::Client {
            return Err(ObjectError::WrongSide {
                operation: "sync",
                side,
            });
        }
        let state = self.state_mut();
        state.position = position;
        state.facing = facing;
        if extra.is_empty() {
            return Ok(());
        }
        state.replace_extra(extra);
        self.on_extra_state_synced()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Lamp {
        state: ObjectState,
        lit: bool,
    }

    impl Replicate for Lamp {
        const TYPE_NAME: &'static str = "Lamp";

        fn state(&self) -> &ObjectState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ObjectState {
            &mut self.state
        }

        fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
            let lit = state
                .extra_state()
                .first()
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(Self { state, lit })
        }

        fn on_extra_state_synced(&mut self) -> Result<(), ObjectError> {
            self.lit = self.state.extra_state().first() == Some(&json!(true));
            Ok(())
        }
    }

    fn lamp() -> Lamp {
        let state = ObjectState::new(Position::new(1.0, 2.0), Facing::East)
            .with_extra([false])
            .unwrap();
        Lamp::from_state(state).unwrap()
    }

    #[test]
    fn test_with_extra_converts_values_to_json() {
        let state = ObjectState::default()
            .with_extra(vec![json!(1), json!("two"), json!([3])])
            .unwrap();
        assert_eq!(state.extra_state(), &[json!(1), json!("two"), json!([3])]);
    }

    #[test]
    fn test_with_extra_rejects_unserializable_value() {
        use std::collections::HashMap;

        // Maps with non-string keys have no JSON representation.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let err = ObjectState::default().with_extra([bad]).unwrap_err();
        assert!(matches!(err, ObjectError::NotSerializable { index: 0, .. }));
    }

    #[test]
    fn test_assign_id_twice_fails() {
        let mut state = ObjectState::default();
        state.assign_id(ObjectId::new("a")).unwrap();
        let err = state.assign_id(ObjectId::new("b")).unwrap_err();
        assert!(matches!(err, ObjectError::IdAlreadyAssigned(id) if id.as_str() == "a"));
        assert_eq!(state.id().unwrap().as_str(), "a");
    }

    #[test]
    fn test_pack_uses_type_name_and_core_fields() {
        let record = lamp().pack();
        assert_eq!(record.type_name, "Lamp");
        assert_eq!(record.position, Position::new(1.0, 2.0));
        assert_eq!(record.facing, Facing::East);
        assert_eq!(record.extra, vec![json!(false)]);
    }

    #[test]
    fn test_require_id_on_unregistered_object_fails() {
        let err = lamp().require_id().unwrap_err();
        assert!(matches!(err, ObjectError::UnassignedId));
    }

    #[test]
    fn test_sync_on_server_side_is_rejected() {
        let mut lamp = lamp();
        let err = lamp
            .sync(Side::Server, Position::new(9.0, 9.0), Facing::West, vec![])
            .unwrap_err();
        assert!(matches!(err, ObjectError::WrongSide { side: Side::Server, .. }));
        assert_eq!(ReplicatedObject::position(&lamp), Position::new(1.0, 2.0));
    }

    #[test]
    fn test_sync_updates_core_fields_and_runs_hook() {
        let mut lamp = lamp();
        lamp.sync(
            Side::Client,
            Position::new(3.0, 4.0),
            Facing::South,
            vec![json!(true)],
        )
        .unwrap();
        assert_eq!(ReplicatedObject::position(&lamp), Position::new(3.0, 4.0));
        assert_eq!(ReplicatedObject::facing(&lamp), Facing::South);
        assert!(lamp.lit);
    }

    #[test]
    fn test_sync_without_extra_keeps_previous_extra() {
        let mut lamp = lamp();
        lamp.sync(Side::Client, Position::default(), Facing::North, vec![json!(true)])
            .unwrap();
        lamp.sync(Side::Client, Position::new(5.0, 5.0), Facing::North, vec![])
            .unwrap();
        assert_eq!(lamp.state.extra_state(), &[json!(true)]);
        assert!(lamp.lit);
    }
}
