//! Per-type tables of remotely invocable methods.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{ObjectError, Replicate};

type BoxedMethod<T> = Box<dyn Fn(&mut T, Vec<Value>) -> Result<(), ObjectError> + Send + Sync>;

/// Methods of one replicated type, keyed by the name clients call them by.
///
/// Each method declares its argument type; the positional JSON arguments
/// of a request are decoded into it as a tuple (or any other type that
/// deserializes from a JSON array). A method with no arguments can take
/// `()`.
pub struct MethodTable<T> {
    methods: HashMap<String, BoxedMethod<T>>,
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

impl<T: Replicate> MethodTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a method.
    ///
    /// The handler returns `Err(reason)` to refuse a call; the reason is
    /// reported back to the caller as [`ObjectError::MethodFailed`].
    pub fn method<A, F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        A: DeserializeOwned,
        F: Fn(&mut T, A) -> Result<(), String> + Send + Sync + 'static,
    {
        let method = name.to_string();
        let boxed: BoxedMethod<T> = Box::new(move |object, args| {
            let args = decode_args::<A>(&method, args)?;
            handler(object, args).map_err(|reason| ObjectError::MethodFailed {
                method: method.clone(),
                reason,
            })
        });
        self.methods.insert(name.to_string(), boxed);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Runs `name` on `object`.
    ///
    /// # Errors
    /// [`ObjectError::MethodNotFound`], [`ObjectError::BadArguments`] or
    /// whatever the method itself returned.
    pub fn call(&self, object: &mut T, name: &str, args: Vec<Value>) -> Result<(), ObjectError> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| ObjectError::MethodNotFound {
                type_name: T::TYPE_NAME.to_string(),
                method: name.to_string(),
            })?;
        method(object, args)
    }
}

impl<T> MethodTable<T> {
    /// Method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn decode_args<A: DeserializeOwned>(method: &str, args: Vec<Value>) -> Result<A, ObjectError> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        // `()` deserializes from `null`, not from `[]`.
        Err(_) if empty => serde_json::from_value(Value::Null),
        Err(e) => Err(e),
    }
    .map_err(|e| ObjectError::BadArguments {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
