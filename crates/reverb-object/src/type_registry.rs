//! Type name → constructor and method table.

use std::collections::HashMap;

use serde_json::Value;

use crate::{MethodTable, ObjectError, ObjectState, Replicate, ReplicatedObject};

type Factory = fn(ObjectState) -> Result<Box<dyn ReplicatedObject>, ObjectError>;

type Invoker = Box<
    dyn Fn(&mut dyn ReplicatedObject, &str, Vec<Value>) -> Result<(), ObjectError> + Send + Sync,
>;

struct TypeEntry {
    factory: Factory,
    invoke: Invoker,
    methods: Vec<String>,
}

/// Registry of the replicated variants an endpoint knows how to build.
///
/// Keyed by [`Replicate::TYPE_NAME`], which is what snapshot records
/// carry. A client must have registered a variant before it can mirror
/// objects of that type.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<&'static str, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`. Registering the same type again is a no-op.
    ///
    /// Returns `true` if the type was newly added.
    pub fn register<T: Replicate>(&mut self) -> bool {
        if self.types.contains_key(T::TYPE_NAME) {
            return false;
        }

        let mut table = MethodTable::<T>::new();
        T::register_methods(&mut table);
        let methods = table.names().into_iter().map(str::to_string).collect();

        let invoke: Invoker = Box::new(move |object, method, args| {
            let actual = object.type_name();
            let typed = object.as_any_mut().downcast_mut::<T>().ok_or_else(|| {
                ObjectError::TypeMismatch {
                    expected: T::TYPE_NAME.to_string(),
                    actual: actual.to_string(),
                }
            })?;
            table.call(typed, method, args)
        });

        self.types.insert(
            T::TYPE_NAME,
            TypeEntry {
                factory: construct::<T>,
                invoke,
                methods,
            },
        );
        tracing::debug!(type_name = T::TYPE_NAME, "replicated type registered");
        true
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Builds an instance of a registered type from its core fields.
    ///
    /// # Errors
    /// [`ObjectError::TypeNotRegistered`], or whatever the variant's
    /// `from_state` returns.
    pub fn construct(
        &self,
        type_name: &str,
        state: ObjectState,
    ) -> Result<Box<dyn ReplicatedObject>, ObjectError> {
        let entry = self.entry(type_name)?;
        (entry.factory)(state)
    }

    /// Runs `method` on `object` through its type's method table.
    pub fn invoke(
        &self,
        object: &mut dyn ReplicatedObject,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), ObjectError> {
        let entry = self.entry(object.type_name())?;
        (entry.invoke)(object, method, args)
    }

    /// Names of the remotely invocable methods of `type_name`, sorted.
    pub fn methods(&self, type_name: &str) -> Option<&[String]> {
        self.types.get(type_name).map(|entry| entry.methods.as_slice())
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn entry(&self, type_name: &str) -> Result<&TypeEntry, ObjectError> {
        self.types
            .get(type_name)
            .ok_or_else(|| ObjectError::TypeNotRegistered(type_name.to_string()))
    }
}

fn construct<T: Replicate>(state: ObjectState) -> Result<Box<dyn ReplicatedObject>, ObjectError> {
    Ok(Box::new(T::from_state(state)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverb_protocol::{Facing, Position};
    use serde_json::json;

    struct Counter {
        state: ObjectState,
        count: i64,
    }

    impl Replicate for Counter {
        const TYPE_NAME: &'static str = "Counter";

        fn state(&self) -> &ObjectState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ObjectState {
            &mut self.state
        }

        fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
            Ok(Self { state, count: 0 })
        }

        fn register_methods(methods: &mut MethodTable<Self>) {
            methods
                .method("add", |c: &mut Counter, (n,): (i64,)| {
                    if n < 0 {
                        return Err("negative step".to_string());
                    }
                    c.count += n;
                    Ok(())
                })
                .method("reset", |c: &mut Counter, (): ()| {
                    c.count = 0;
                    Ok(())
                });
        }
    }

    struct Rock {
        state: ObjectState,
    }

    impl Replicate for Rock {
        const TYPE_NAME: &'static str = "Rock";

        fn state(&self) -> &ObjectState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ObjectState {
            &mut self.state
        }

        fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
            Ok(Self { state })
        }
    }

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.register::<Counter>();
        types.register::<Rock>();
        types
    }

    fn counter(types: &TypeRegistry) -> Box<dyn ReplicatedObject> {
        types.construct("Counter", ObjectState::default()).unwrap()
    }

    fn count(object: &dyn ReplicatedObject) -> i64 {
        object.as_any().downcast_ref::<Counter>().unwrap().count
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut types = TypeRegistry::new();
        assert!(types.register::<Counter>());
        assert!(!types.register::<Counter>());
        assert_eq!(types.len(), 1);
        assert_eq!(types.type_names(), vec!["Counter"]);
    }

    #[test]
    fn test_construct_builds_registered_type() {
        let types = registry();
        let state = ObjectState::new(Position::new(4.0, 5.0), Facing::West);
        let rock = types.construct("Rock", state).unwrap();
        assert_eq!(rock.type_name(), "Rock");
        assert_eq!(rock.position(), Position::new(4.0, 5.0));
        assert_eq!(rock.facing(), Facing::West);
        assert!(rock.id().is_none());
    }

    #[test]
    fn test_construct_unknown_type_fails() {
        let err = registry()
            .construct("Dragon", ObjectState::default())
            .err()
            .unwrap();
        assert!(matches!(err, ObjectError::TypeNotRegistered(name) if name == "Dragon"));
    }

    #[test]
    fn test_invoke_runs_method_with_decoded_args() {
        let types = registry();
        let mut object = counter(&types);
        types.invoke(object.as_mut(), "add", vec![json!(3)]).unwrap();
        types.invoke(object.as_mut(), "add", vec![json!(4)]).unwrap();
        assert_eq!(count(object.as_ref()), 7);
    }

    #[test]
    fn test_invoke_zero_arg_method_with_empty_args() {
        let types = registry();
        let mut object = counter(&types);
        types.invoke(object.as_mut(), "add", vec![json!(2)]).unwrap();
        types.invoke(object.as_mut(), "reset", vec![]).unwrap();
        assert_eq!(count(object.as_ref()), 0);
    }

    #[test]
    fn test_invoke_unknown_method_fails() {
        let types = registry();
        let mut object = counter(&types);
        let err = types.invoke(object.as_mut(), "explode", vec![]).unwrap_err();
        assert!(matches!(
            err,
            ObjectError::MethodNotFound { type_name, method } if type_name == "Counter" && method == "explode"
        ));
    }

    #[test]
    fn test_invoke_on_type_without_methods_fails() {
        let types = registry();
        let mut rock = types.construct("Rock", ObjectState::default()).unwrap();
        let err = types.invoke(rock.as_mut(), "add", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, ObjectError::MethodNotFound { .. }));
    }

    #[test]
    fn test_invoke_with_wrong_args_fails() {
        let types = registry();
        let mut object = counter(&types);
        let err = types
            .invoke(object.as_mut(), "add", vec![json!("three")])
            .unwrap_err();
        assert!(matches!(err, ObjectError::BadArguments { method, .. } if method == "add"));
        let err = types.invoke(object.as_mut(), "add", vec![]).unwrap_err();
        assert!(matches!(err, ObjectError::BadArguments { .. }));
        assert_eq!(count(object.as_ref()), 0);
    }

    #[test]
    fn test_invoke_method_refusal_is_reported() {
        let types = registry();
        let mut object = counter(&types);
        let err = types
            .invoke(object.as_mut(), "add", vec![json!(-1)])
            .unwrap_err();
        assert!(matches!(
            err,
            ObjectError::MethodFailed { method, reason } if method == "add" && reason == "negative step"
        ));
    }

    #[test]
    fn test_methods_lists_names_sorted() {
        let types = registry();
        assert_eq!(
            types.methods("Counter").unwrap(),
            &["add".to_string(), "reset".to_string()]
        );
        assert!(types.methods("Rock").unwrap().is_empty());
        assert!(types.methods("Dragon").is_none());
    }
}
