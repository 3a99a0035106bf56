use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of an offloadable method: receiver type, method name and
/// parameter type descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodIdentity {
    pub type_name: String,
    pub method: String,
    #[serde(default)]
    pub param_types: Vec<String>,
}

impl MethodIdentity {
    pub fn new(
        type_name: impl Into<String>,
        method: impl Into<String>,
        param_types: &[&str],
    ) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            param_types: param_types.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.type_name,
            self.method,
            self.param_types.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The invoked method itself reported a failure.
    Application,
    BadArguments,
    UnknownMethod,
    UnknownType,
    Panicked,
    Unsupported,
    ShuttingDown,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArguments, message)
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for InvocationError {}

/// Result of one invocation as seen by the caller.
///
/// A method that fails is still a delivered result: callers inspect the tag
/// to tell success from application-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success { value: Value },
    Failed { error: InvocationError },
}

impl InvocationOutcome {
    pub fn success(value: impl Into<Value>) -> Self {
        InvocationOutcome::Success {
            value: value.into(),
        }
    }

    pub fn failed(error: InvocationError) -> Self {
        InvocationOutcome::Failed { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Success { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            InvocationOutcome::Success { value } => Some(value),
            InvocationOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&InvocationError> {
        match self {
            InvocationOutcome::Success { .. } => None,
            InvocationOutcome::Failed { error } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, InvocationError> {
        match self {
            InvocationOutcome::Success { value } => Ok(value),
            InvocationOutcome::Failed { error } => Err(error),
        }
    }
}

impl From<Result<Value, InvocationError>> for InvocationOutcome {
    fn from(res: Result<Value, InvocationError>) -> Self {
        match res {
            Ok(value) => InvocationOutcome::Success { value },
            Err(error) => InvocationOutcome::Failed { error },
        }
    }
}
