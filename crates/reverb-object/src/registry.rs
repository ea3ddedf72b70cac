//! The per-endpoint object registry.

use std::collections::HashMap;

use rand::Rng;
use reverb_protocol::{ObjectId, Snapshot, SyncRecord};

use crate::{ObjectError, Replicate, ReplicatedObject, Side};

/// Every replicated object an endpoint knows about, keyed by id.
///
/// On the server this holds the authoritative objects and hands out
/// their ids. On a client it holds mirrors adopted from snapshots under
/// the ids the server chose.
///
/// Not thread-safe by itself; endpoints share it behind a lock.
pub struct ObjectRegistry {
    side: Side,
    objects: HashMap<ObjectId, Box<dyn ReplicatedObject>>,
}

impl ObjectRegistry {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            objects: HashMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Registers a freshly created server object and returns the id it
    /// was given.
    ///
    /// # Errors
    /// - [`ObjectError::WrongSide`] on a client registry.
    /// - [`ObjectError::IdAlreadyAssigned`] if the object already has an id.
    pub fn register(
        &mut self,
        mut object: Box<dyn ReplicatedObject>,
    ) -> Result<ObjectId, ObjectError> {
        self.require_side(Side::Server, "register")?;
        if let Some(id) = object.id() {
            return Err(ObjectError::IdAlreadyAssigned(id.clone()));
        }

        let id = loop {
            let candidate = generate_id();
            if !self.objects.contains_key(&candidate) {
                break candidate;
            }
        };
        object.assign_id(id.clone())?;
        tracing::debug!(%id, type_name = object.type_name(), "object registered");
        self.objects.insert(id.clone(), object);
        Ok(id)
    }

    /// Adds a mirror under the id the server assigned.
    ///
    /// # Errors
    /// - [`ObjectError::WrongSide`] on the server registry.
    /// - [`ObjectError::DuplicateId`] if `id` is already present.
    /// - [`ObjectError::IdAlreadyAssigned`] if the object carries an id.
    pub fn adopt(
        &mut self,
        id: ObjectId,
        mut object: Box<dyn ReplicatedObject>,
    ) -> Result<(), ObjectError> {
        self.require_side(Side::Client, "adopt")?;
        if self.objects.contains_key(&id) {
            return Err(ObjectError::DuplicateId(id));
        }
        object.assign_id(id.clone())?;
        tracing::debug!(%id, type_name = object.type_name(), "mirror adopted");
        self.objects.insert(id, object);
        Ok(())
    }

    /// Applies one snapshot record to an existing mirror.
    ///
    /// # Errors
    /// - [`ObjectError::WrongSide`] on the server registry.
    /// - [`ObjectError::ObjectNotFound`] if no mirror has this id.
    /// - [`ObjectError::InvalidRecord`] if the record names another type.
    pub fn apply_sync(&mut self, id: &ObjectId, record: SyncRecord) -> Result<(), ObjectError> {
        self.require_side(Side::Client, "sync")?;
        let object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| ObjectError::ObjectNotFound(id.clone()))?;
        if object.type_name() != record.type_name {
            return Err(ObjectError::InvalidRecord {
                id: id.clone(),
                reason: format!(
                    "record is a {}, existing object is a {}",
                    record.type_name,
                    object.type_name()
                ),
            });
        }
        object.sync(Side::Client, record.position, record.facing, record.extra)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&dyn ReplicatedObject> {
        self.objects.get(id).map(|object| &**object)
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut (dyn ReplicatedObject + 'static)> {
        self.objects.get_mut(id).map(|object| &mut **object)
    }

    /// Typed lookup: `None` if the id is unknown or the object isn't a `T`.
    pub fn get_as<T: Replicate>(&self, id: &ObjectId) -> Option<&T> {
        self.get(id)?.as_any().downcast_ref::<T>()
    }

    pub fn get_as_mut<T: Replicate>(&mut self, id: &ObjectId) -> Option<&mut T> {
        self.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Removes an object. It stops appearing in later snapshots.
    pub fn remove(&mut self, id: &ObjectId) -> Option<Box<dyn ReplicatedObject>> {
        let removed = self.objects.remove(id);
        if removed.is_some() {
            tracing::debug!(%id, "object removed");
        }
        removed
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// All ids, sorted.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.objects.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Packs every object into a snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.objects
            .iter()
            .map(|(id, object)| (id.clone(), object.pack()))
            .collect()
    }

    fn require_side(&self, side: Side, operation: &'static str) -> Result<(), ObjectError> {
        if self.side == side {
            Ok(())
        } else {
            Err(ObjectError::WrongSide {
                operation,
                side: self.side,
            })
        }
    }
}

/// 128 random bits as 32 lowercase hex characters.
fn generate_id() -> ObjectId {
    let bytes: [u8; 16] = rand::rng().random();
    ObjectId::new(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}
