//! Payload types that travel on the wire.
//!
//! Everything here is plain data with serde impls whose JSON shape is
//! part of the protocol. The tests at the bottom pin those shapes down:
//! a mismatch means a peer built from another version can't read us.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One decoded frame: an event name and its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// The event this packet should be dispatched under.
    pub name: String,
    /// The event payload. `null` for events without one.
    pub contents: Value,
}

// ---------------------------------------------------------------------------
// Object state
// ---------------------------------------------------------------------------

/// Identifier of a replicated object.
///
/// Generated by the server when the object is registered and adopted
/// as-is by every client mirror. Serialized as a plain string, which is
/// also what makes it usable as a JSON object key in a [`Snapshot`].
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wraps an identifier received from elsewhere (the wire, a test).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 2D position, `[x, y]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position(pub f64, pub f64);

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self(x, y)
    }

    /// Returns this position moved by `(dx, dy)`.
    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self(self.0 + dx, self.1 + dy)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

/// The direction an object faces, sent as a one-letter token.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum Facing {
    #[default]
    #[serde(rename = "N")]
    North,
    #[serde(rename = "E")]
    East,
    #[serde(rename = "S")]
    South,
    #[serde(rename = "W")]
    West,
}

impl Facing {
    /// The wire token for this direction.
    pub fn token(self) -> &'static str {
        match self {
            Self::North => "N",
            Self::East => "E",
            Self::South => "S",
            Self::West => "W",
        }
    }

    /// Unit step `(dx, dy)` one cell in this direction, north being +y.
    pub fn step(self) -> (f64, f64) {
        match self {
            Self::North => (0.0, 1.0),
            Self::East => (1.0, 0.0),
            Self::South => (0.0, -1.0),
            Self::West => (-1.0, 0.0),
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Facing {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N" => Ok(Self::North),
            "E" => Ok(Self::East),
            "S" => Ok(Self::South),
            "W" => Ok(Self::West),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown facing token {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncRecord / Snapshot
// ---------------------------------------------------------------------------

/// The state of one object inside a `server_sync` snapshot.
///
/// On the wire this is a flat array, not an object:
///
/// ```text
/// ["Pawn", [0.0, 0.0], "N", <extra 0>, <extra 1>, ...]
/// ```
///
/// The first three slots are mandatory; anything after them is the
/// variant's extra state, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub type_name: String,
    pub position: Position,
    pub facing: Facing,
    pub extra: Vec<Value>,
}

impl Serialize for SyncRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3 + self.extra.len()))?;
        seq.serialize_element(&self.type_name)?;
        seq.serialize_element(&self.position)?;
        seq.serialize_element(&self.facing)?;
        for value in &self.extra {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for SyncRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(SyncRecordVisitor)
    }
}

struct SyncRecordVisitor;

impl<'de> Visitor<'de> for SyncRecordVisitor {
    type Value = SyncRecord;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array [type_name, position, facing, ...extra_state]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<SyncRecord, A::Error> {
        let type_name = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let position = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let facing = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
        let mut extra = Vec::new();
        while let Some(value) = seq.next_element::<Value>()? {
            extra.push(value);
        }
        Ok(SyncRecord {
            type_name,
            position,
            facing,
            extra,
        })
    }
}

/// A full `server_sync` payload: every object's record, keyed by id.
///
/// A `BTreeMap` keeps the encoded snapshot stable from tick to tick,
/// which makes captured traffic diffable.
pub type Snapshot = BTreeMap<ObjectId, SyncRecord>;

// ---------------------------------------------------------------------------
// Remote invocation
// ---------------------------------------------------------------------------

/// A client's request to run `method` on the server-side object.
///
/// Encoded as the array `[object_id, method, [args...]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "(ObjectId, String, Vec<Value>)",
    into = "(ObjectId, String, Vec<Value>)"
)]
pub struct InvokeRequest {
    pub object_id: ObjectId,
    pub method: String,
    pub args: Vec<Value>,
}

impl From<(ObjectId, String, Vec<Value>)> for InvokeRequest {
    fn from((object_id, method, args): (ObjectId, String, Vec<Value>)) -> Self {
        Self {
            object_id,
            method,
            args,
        }
    }
}

impl From<InvokeRequest> for (ObjectId, String, Vec<Value>) {
    fn from(req: InvokeRequest) -> Self {
        (req.object_id, req.method, req.args)
    }
}

/// Server → client notice that an [`InvokeRequest`] was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRejected {
    pub object_id: ObjectId,
    pub method: String,
    /// Human-readable cause (unknown object, unknown method, bad args...).
    pub reason: String,
}

/// Payload of `client_disconnection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnection {
    /// The server address as the leaving client saw it.
    pub addr: String,
}
