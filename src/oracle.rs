use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::invocation::MethodIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionVerdict {
    Local,
    Remote,
    /// Resolved to Local or Remote by the oracle before dispatch.
    Dynamic,
    /// Declared, not implemented.
    Hybrid,
}

impl ExecutionVerdict {
    /// Parse a user choice. Unknown text falls back to `Dynamic`.
    pub fn parse_choice(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => ExecutionVerdict::Local,
            "REMOTE" => ExecutionVerdict::Remote,
            "DYNAMIC" => ExecutionVerdict::Dynamic,
            "HYBRID" => ExecutionVerdict::Hybrid,
            _ => {
                error!(choice = raw, "wrong user choice, defaulting to DYNAMIC");
                ExecutionVerdict::Dynamic
            }
        }
    }
}

/// Maps (application, method) to an execution location.
pub trait DecisionOracle: Send + Sync {
    fn resolve(&self, app_id: &str, method: &MethodIdentity) -> ExecutionVerdict;
}

/// Always answers the same verdict.
#[derive(Debug, Clone, Copy)]
pub struct FixedOracle(pub ExecutionVerdict);

impl DecisionOracle for FixedOracle {
    fn resolve(&self, _app_id: &str, _method: &MethodIdentity) -> ExecutionVerdict {
        self.0
    }
}

/// Per-method verdicts keyed by method name, with a default.
#[derive(Debug, Clone)]
pub struct TableOracle {
    verdicts: HashMap<String, ExecutionVerdict>,
    default: ExecutionVerdict,
}

impl TableOracle {
    pub fn new(default: ExecutionVerdict) -> Self {
        Self {
            verdicts: HashMap::new(),
            default,
        }
    }

    pub fn with(mut self, method: &str, verdict: ExecutionVerdict) -> Self {
        self.verdicts.insert(method.to_string(), verdict);
        self
    }
}

impl DecisionOracle for TableOracle {
    fn resolve(&self, _app_id: &str, method: &MethodIdentity) -> ExecutionVerdict {
        self.verdicts
            .get(&method.method)
            .copied()
            .unwrap_or(self.default)
    }
}

/// A user-selected location layered over a dynamic oracle: LOCAL and REMOTE
/// are forced, DYNAMIC defers to the inner oracle.
pub struct UserChoiceOracle {
    choice: RwLock<ExecutionVerdict>,
    dynamic: Arc<dyn DecisionOracle>,
}

impl UserChoiceOracle {
    pub fn new(dynamic: Arc<dyn DecisionOracle>) -> Self {
        Self {
            choice: RwLock::new(ExecutionVerdict::Dynamic),
            dynamic,
        }
    }

    pub fn choice(&self) -> ExecutionVerdict {
        match self.choice.read() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_choice(&self, verdict: ExecutionVerdict) {
        match self.choice.write() {
            Ok(mut g) => *g = verdict,
            Err(poisoned) => *poisoned.into_inner() = verdict,
        }
    }

    pub fn set_choice_str(&self, raw: &str) {
        self.set_choice(ExecutionVerdict::parse_choice(raw));
    }
}

impl DecisionOracle for UserChoiceOracle {
    fn resolve(&self, app_id: &str, method: &MethodIdentity) -> ExecutionVerdict {
        match self.choice() {
            ExecutionVerdict::Dynamic => self.dynamic.resolve(app_id, method),
            forced => forced,
        }
    }
}
