//! Snapshot broadcast (server) and reconciliation (client).

use reverb_object::{ObjectError, ObjectRegistry, ObjectState, TypeRegistry};
use reverb_protocol::{ObjectId, PacketCodec, ProtocolError, SyncRecord, events};
use serde::Deserialize;
use serde_json::Value;

/// Outcome of applying one `server_sync` payload.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Existing mirrors that were updated.
    pub updated: Vec<ObjectId>,
    /// Mirrors created from records for ids seen for the first time.
    pub created: Vec<ObjectId>,
    /// Records that could not be applied. The rest of the batch was.
    pub failures: Vec<(ObjectId, ObjectError)>,
}

impl SyncReport {
    /// `true` if every record applied.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Encodes the whole registry as one `server_sync` frame.
pub fn snapshot_frame(
    objects: &ObjectRegistry,
    codec: &PacketCodec,
) -> Result<Vec<u8>, ProtocolError> {
    codec.encode(events::SERVER_SYNC, &objects.snapshot())
}

/// Applies a `server_sync` payload to a client registry.
///
/// For each record: update the mirror if the id is known, otherwise build
/// one through the type registry and adopt it under the wire id. Records
/// are independent; one bad record is reported and skipped.
///
/// Applying the same payload twice leaves the registry as applying it once.
///
/// # Errors
/// [`ProtocolError::InvalidMessage`] if the payload is not a JSON object.
pub fn reconcile(
    objects: &mut ObjectRegistry,
    types: &TypeRegistry,
    payload: &Value,
) -> Result<SyncReport, ProtocolError> {
    let Value::Object(records) = payload else {
        return Err(ProtocolError::InvalidMessage(format!(
            "{} payload must be an object, got {payload}",
            events::SERVER_SYNC
        )));
    };

    let mut report = SyncReport::default();
    for (raw_id, raw_record) in records {
        let id = ObjectId::new(raw_id.as_str());
        let outcome = SyncRecord::deserialize(raw_record)
            .map_err(|e| ObjectError::InvalidRecord {
                id: id.clone(),
                reason: e.to_string(),
            })
            .and_then(|record| apply_record(objects, types, &id, record));

        match outcome {
            Ok(Applied::Updated) => report.updated.push(id),
            Ok(Applied::Created) => report.created.push(id),
            Err(e) => report.failures.push((id, e)),
        }
    }
    Ok(report)
}

enum Applied {
    Updated,
    Created,
}

fn apply_record(
    objects: &mut ObjectRegistry,
    types: &TypeRegistry,
    id: &ObjectId,
    record: SyncRecord,
) -> Result<Applied, ObjectError> {
    if objects.contains(id) {
        objects.apply_sync(id, record)?;
        return Ok(Applied::Updated);
    }

    let state = ObjectState::new(record.position, record.facing).with_extra(record.extra)?;
    let mirror = types.construct(&record.type_name, state)?;
    objects.adopt(id.clone(), mirror)?;
    tracing::debug!(%id, type_name = %record.type_name, "mirror created from snapshot");
    Ok(Applied::Created)
}
