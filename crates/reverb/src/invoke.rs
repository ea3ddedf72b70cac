//! Remote invocation: clients ask the server to run a method on an object.
//!
//! The request carries no reply. A successful call shows up in the next
//! snapshot; a refused one comes back as an `invoke_rejected` event.

use reverb_object::{ObjectError, ObjectRegistry, TypeRegistry};
use reverb_protocol::{InvokeRejected, InvokeRequest, ObjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Builds the request for `method` on `object_id`.
///
/// `args` must serialize to a JSON array (a tuple, a `Vec`, a slice...),
/// or to `null` for a call without arguments.
///
/// # Errors
/// [`ObjectError::BadArguments`] if `args` is neither.
pub fn request<A: Serialize + ?Sized>(
    object_id: &ObjectId,
    method: &str,
    args: &A,
) -> Result<InvokeRequest, ObjectError> {
    let bad_args = |reason: String| ObjectError::BadArguments {
        method: method.to_string(),
        reason,
    };
    let args = match serde_json::to_value(args).map_err(|e| bad_args(e.to_string()))? {
        Value::Array(args) => args,
        Value::Null => Vec::new(),
        other => {
            return Err(bad_args(format!(
                "arguments must serialize to a JSON array, got {other}"
            )));
        }
    };
    Ok(InvokeRequest {
        object_id: object_id.clone(),
        method: method.to_string(),
        args,
    })
}

/// Runs a `calling_server_computing` payload against the server registry.
///
/// # Errors
/// The rejection to send back when the payload is malformed, the object
/// or method is unknown, the arguments don't fit or the method refuses.
pub(crate) fn execute(
    objects: &mut ObjectRegistry,
    types: &TypeRegistry,
    payload: &Value,
) -> Result<(), InvokeRejected> {
    let request = InvokeRequest::deserialize(payload).map_err(|e| InvokeRejected {
        object_id: ObjectId::new(payload.get(0).and_then(Value::as_str).unwrap_or_default()),
        method: payload
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        reason: format!("malformed request: {e}"),
    })?;

    let InvokeRequest {
        object_id,
        method,
        args,
    } = request;

    let outcome = match objects.get_mut(&object_id) {
        Some(object) => types.invoke(object, &method, args),
        None => Err(ObjectError::ObjectNotFound(object_id.clone())),
    };

    match outcome {
        Ok(()) => {
            tracing::debug!(%object_id, %method, "remote invocation applied");
            Ok(())
        }
        Err(e) => Err(InvokeRejected {
            object_id,
            method,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverb_object::{MethodTable, ObjectState, Replicate, Side};
    use reverb_protocol::{Facing, Position};
    use serde_json::json;

    struct Turret {
        state: ObjectState,
    }

    impl Replicate for Turret {
        const TYPE_NAME: &'static str = "Turret";

        fn state(&self) -> &ObjectState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ObjectState {
            &mut self.state
        }

        fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
            Ok(Self { state })
        }

        fn register_methods(methods: &mut MethodTable<Self>) {
            methods.method("aim", |t: &mut Turret, (facing,): (Facing,)| {
                t.state.facing = facing;
                Ok(())
            });
        }
    }

    fn server() -> (ObjectRegistry, TypeRegistry, ObjectId) {
        let mut types = TypeRegistry::new();
        types.register::<Turret>();
        let mut objects = ObjectRegistry::new(Side::Server);
        let id = objects
            .register(Box::new(Turret {
                state: ObjectState::new(Position::default(), Facing::North),
            }))
            .unwrap();
        (objects, types, id)
    }

    fn payload(id: &ObjectId, method: &str, args: Value) -> Value {
        serde_json::to_value(request(id, method, &args).unwrap()).unwrap()
    }

    #[test]
    fn test_request_encodes_as_positional_array() {
        let req = request(&ObjectId::new("t1"), "aim", &("E",)).unwrap();
        assert_eq!(serde_json::to_value(req).unwrap(), json!(["t1", "aim", ["E"]]));
    }

    #[test]
    fn test_request_without_args() {
        let req = request(&ObjectId::new("t1"), "fire", &()).unwrap();
        assert!(req.args.is_empty());
    }

    #[test]
    fn test_request_with_non_array_args_fails() {
        let err = request(&ObjectId::new("t1"), "aim", &json!({"dir": "E"})).unwrap_err();
        assert!(matches!(err, ObjectError::BadArguments { .. }));
    }

    #[test]
    fn test_execute_runs_method() {
        let (mut objects, types, id) = server();
        execute(&mut objects, &types, &payload(&id, "aim", json!(["W"]))).unwrap();
        assert_eq!(objects.get(&id).unwrap().facing(), Facing::West);
    }

    #[test]
    fn test_execute_unknown_object_is_rejected() {
        let (mut objects, types, _) = server();
        let ghost = ObjectId::new("ghost");
        let rejected = execute(&mut objects, &types, &payload(&ghost, "aim", json!(["W"])))
            .unwrap_err();
        assert_eq!(rejected.object_id, ghost);
        assert_eq!(rejected.method, "aim");
        assert!(rejected.reason.contains("not found"));
    }

    #[test]
    fn test_execute_unknown_method_is_rejected() {
        let (mut objects, types, id) = server();
        let rejected = execute(&mut objects, &types, &payload(&id, "self_destruct", json!([])))
            .unwrap_err();
        assert_eq!(rejected.method, "self_destruct");
        assert!(rejected.reason.contains("no method"));
    }

    #[test]
    fn test_execute_bad_args_leave_object_untouched() {
        let (mut objects, types, id) = server();
        let rejected = execute(&mut objects, &types, &payload(&id, "aim", json!(["up"])))
            .unwrap_err();
        assert!(rejected.reason.contains("bad arguments"));
        assert_eq!(objects.get(&id).unwrap().facing(), Facing::North);
    }

    #[test]
    fn test_execute_malformed_payload_is_rejected() {
        let (mut objects, types, _) = server();
        let rejected = execute(&mut objects, &types, &json!(["t1", "aim"])).unwrap_err();
        assert_eq!(rejected.object_id.as_str(), "t1");
        assert_eq!(rejected.method, "aim");
        assert!(rejected.reason.starts_with("malformed request"));
    }
}
