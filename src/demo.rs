//! Demo offloadable type used by the CLI, the reference peer and tests.

use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StateError;
use crate::invocation::{InvocationError, MethodIdentity};
use crate::registry::{arg, snapshot_of, MethodRegistry, Offloadable};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calculator {
    pub accumulator: i64,
    #[serde(default)]
    pub history: Vec<i64>,
    /// Local-only; counts client-side preparation runs.
    #[serde(skip)]
    pub prepared: u32,
}

impl Calculator {
    pub const TYPE: &'static str = "demo.Calculator";

    pub fn new(accumulator: i64) -> Self {
        Self {
            accumulator,
            ..Self::default()
        }
    }

    pub fn add() -> MethodIdentity {
        MethodIdentity::new(Self::TYPE, "add", &["i64", "i64"])
    }

    pub fn accumulate() -> MethodIdentity {
        MethodIdentity::new(Self::TYPE, "accumulate", &["i64"])
    }

    pub fn divide() -> MethodIdentity {
        MethodIdentity::new(Self::TYPE, "divide", &["i64", "i64"])
    }
}

impl Offloadable for Calculator {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn snapshot(&self) -> Result<Value, StateError> {
        snapshot_of(self, Self::TYPE)
    }

    fn merge_state(&mut self, delta: Value) -> Result<(), StateError> {
        let remote: Calculator =
            serde_json::from_value(delta).map_err(|source| StateError::Shape {
                type_name: Self::TYPE.to_string(),
                source,
            })?;
        self.accumulator = remote.accumulator;
        self.history = remote.history;
        Ok(())
    }

    fn prepare_data(&mut self) -> bool {
        self.prepared += 1;
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Register the demo type and its methods.
pub fn register(registry: &mut MethodRegistry) {
    registry
        .register_type::<Calculator>(Calculator::TYPE)
        .register_method(Calculator::add(), |_: &mut Calculator, args| {
            let a: i64 = arg(args, 0)?;
            let b: i64 = arg(args, 1)?;
            a.checked_add(b)
                .map(|v| json!(v))
                .ok_or_else(|| InvocationError::application("integer overflow"))
        })
        .register_method(Calculator::accumulate(), |calc: &mut Calculator, args| {
            let x: i64 = arg(args, 0)?;
            calc.accumulator = calc
                .accumulator
                .checked_add(x)
                .ok_or_else(|| InvocationError::application("integer overflow"))?;
            calc.history.push(x);
            Ok(json!(calc.accumulator))
        })
        .register_method(Calculator::divide(), |_: &mut Calculator, args| {
            let a: i64 = arg(args, 0)?;
            let b: i64 = arg(args, 1)?;
            if b == 0 {
                return Err(InvocationError::application("division by zero"));
            }
            Ok(json!(a / b))
        });
}

pub fn registry() -> MethodRegistry {
    let mut reg = MethodRegistry::new();
    register(&mut reg);
    reg
}
