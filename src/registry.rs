//! Capability contract for offloadable receivers and the typed registry that
//! resolves a [`MethodIdentity`] to a concrete handler.
//!
//! The same registry is used on the device (local execution and fallback)
//! and by the reference peer (restoring a receiver from its snapshot and
//! running the method there).

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StateError;
use crate::invocation::{ErrorKind, InvocationError, InvocationOutcome, MethodIdentity};

/// A receiver whose methods may run locally or on the peer.
pub trait Offloadable: Any + Send {
    /// Stable type identity, shared with the peer.
    fn type_name(&self) -> &str;

    /// Full, independent snapshot of the receiver state.
    fn snapshot(&self) -> Result<Value, StateError>;

    /// Merge state computed remotely into this receiver.
    fn merge_state(&mut self, delta: Value) -> Result<(), StateError>;

    /// Optional client-side preparation run before a remote call.
    /// Returns `true` when the type did any preparation.
    fn prepare_data(&mut self) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Receiver handle shared between the blocked caller and the worker.
pub type SharedReceiver = Arc<Mutex<dyn Offloadable>>;

type Handler = Arc<dyn Fn(&mut dyn Offloadable, &[Value]) -> InvocationOutcome + Send + Sync>;
type Restorer = Arc<dyn Fn(Value) -> Result<Box<dyn Offloadable>, StateError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MethodRegistry {
    types: HashMap<String, Restorer>,
    methods: HashMap<MethodIdentity, Handler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver type so it can be rebuilt from a snapshot.
    pub fn register_type<T>(&mut self, type_name: &str) -> &mut Self
    where
        T: Offloadable + DeserializeOwned,
    {
        let name = type_name.to_string();
        let restorer: Restorer = Arc::new(move |state: Value| {
            let value: T = serde_json::from_value(state).map_err(|source| StateError::Shape {
                type_name: name.clone(),
                source,
            })?;
            Ok(Box::new(value) as Box<dyn Offloadable>)
        });
        self.types.insert(type_name.to_string(), restorer);
        self
    }

    /// Register a typed method handler. A handler returning `Err` produces an
    /// application-level failure, not a dispatcher failure.
    pub fn register_method<T, F>(&mut self, identity: MethodIdentity, f: F) -> &mut Self
    where
        T: Offloadable,
        F: Fn(&mut T, &[Value]) -> Result<Value, InvocationError> + Send + Sync + 'static,
    {
        let expected = identity.type_name.clone();
        let handler: Handler = Arc::new(move |receiver: &mut dyn Offloadable, args: &[Value]| {
            let actual = receiver.type_name().to_string();
            match receiver.as_any_mut().downcast_mut::<T>() {
                Some(typed) => f(typed, args).into(),
                None => InvocationOutcome::failed(InvocationError::new(
                    ErrorKind::UnknownType,
                    format!("handler for '{expected}' cannot run on receiver '{actual}'"),
                )),
            }
        });
        self.methods.insert(identity, handler);
        self
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn has_method(&self, identity: &MethodIdentity) -> bool {
        self.methods.contains_key(identity)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Rebuild a receiver of a registered type from its snapshot.
    pub fn restore(
        &self,
        type_name: &str,
        state: Value,
    ) -> Option<Result<Box<dyn Offloadable>, StateError>> {
        self.types.get(type_name).map(|restore| restore(state))
    }

    /// Run the handler for `identity` on `receiver`. Panics inside the
    /// handler are caught and reported as `Panicked`.
    pub fn invoke(
        &self,
        identity: &MethodIdentity,
        receiver: &mut dyn Offloadable,
        args: &[Value],
    ) -> InvocationOutcome {
        let Some(handler) = self.methods.get(identity) else {
            return InvocationOutcome::failed(InvocationError::new(
                ErrorKind::UnknownMethod,
                format!("no handler registered for {identity}"),
            ));
        };
        if identity.param_types.len() != args.len() {
            return InvocationOutcome::failed(InvocationError::bad_arguments(format!(
                "{identity} takes {} argument(s), got {}",
                identity.param_types.len(),
                args.len()
            )));
        }

        match panic::catch_unwind(AssertUnwindSafe(|| handler(receiver, args))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "method panicked".to_string());
                InvocationOutcome::failed(InvocationError::new(ErrorKind::Panicked, message))
            }
        }
    }
}

/// Decode positional argument `index` as `T`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, InvocationError> {
    let raw = args.get(index).ok_or_else(|| {
        InvocationError::bad_arguments(format!("missing argument at position {index}"))
    })?;
    serde_json::from_value(raw.clone()).map_err(|err| {
        InvocationError::bad_arguments(format!("argument {index} has the wrong shape: {err}"))
    })
}

/// Snapshot helper for serde-backed receivers.
pub fn snapshot_of<T: Serialize>(value: &T, type_name: &str) -> Result<Value, StateError> {
    serde_json::to_value(value).map_err(|source| StateError::Shape {
        type_name: type_name.to_string(),
        source,
    })
}

/// Replace `target` with the state carried by `delta`.
pub fn replace_state<T: DeserializeOwned>(
    target: &mut T,
    type_name: &str,
    delta: Value,
) -> Result<(), StateError> {
    *target = serde_json::from_value(delta).map_err(|source| StateError::Shape {
        type_name: type_name.to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        total: i64,
    }

    impl Offloadable for Counter {
        fn type_name(&self) -> &str {
            "test.Counter"
        }
        fn snapshot(&self) -> Result<Value, StateError> {
            snapshot_of(self, "test.Counter")
        }
        fn merge_state(&mut self, delta: Value) -> Result<(), StateError> {
            replace_state(self, "test.Counter", delta)
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn bump() -> MethodIdentity {
        MethodIdentity::new("test.Counter", "bump", &["i64"])
    }

    fn registry() -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        reg.register_type::<Counter>("test.Counter")
            .register_method(bump(), |c: &mut Counter, args| {
                let by: i64 = arg(args, 0)?;
                if by < 0 {
                    panic!("negative bump");
                }
                c.total += by;
                Ok(json!(c.total))
            });
        reg
    }

    #[test]
    fn invoke_runs_typed_handler_and_mutates_receiver() {
        let reg = registry();
        let mut c = Counter { total: 1 };
        let out = reg.invoke(&bump(), &mut c, &[json!(4)]);
        assert_eq!(out, InvocationOutcome::success(5));
        assert_eq!(c.total, 5);
    }

    #[test]
    fn invoke_reports_unknown_method_and_arity() {
        let reg = registry();
        let mut c = Counter::default();
        let missing = MethodIdentity::new("test.Counter", "reset", &[]);
        let out = reg.invoke(&missing, &mut c, &[]);
        assert_eq!(out.error().unwrap().kind, ErrorKind::UnknownMethod);

        let out = reg.invoke(&bump(), &mut c, &[]);
        assert_eq!(out.error().unwrap().kind, ErrorKind::BadArguments);
    }

    #[test]
    fn invoke_catches_panics() {
        let reg = registry();
        let mut c = Counter::default();
        let out = reg.invoke(&bump(), &mut c, &[json!(-1)]);
        let err = out.error().expect("panic should surface as failure");
        assert_eq!(err.kind, ErrorKind::Panicked);
        assert!(err.message.contains("negative bump"), "{err}");
    }

    #[test]
    fn restore_rebuilds_receiver_from_snapshot() {
        let reg = registry();
        let restored = reg
            .restore("test.Counter", json!({"total": 9}))
            .expect("type registered")
            .expect("snapshot valid");
        assert_eq!(restored.snapshot().unwrap(), json!({"total": 9}));
        assert!(reg.restore("test.Other", json!({})).is_none());
    }
}
