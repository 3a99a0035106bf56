use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::instrument::{nanos, Durations, ExecLocation, InstrumentationSink, Probe};
use crate::invocation::InvocationOutcome;
use crate::queue::{lock, Task};
use crate::registry::MethodRegistry;

/// In-process invocation path with timing instrumentation.
#[derive(Clone)]
pub struct LocalInvoker {
    app_id: String,
    registry: Arc<MethodRegistry>,
    sink: Arc<dyn InstrumentationSink>,
}

impl LocalInvoker {
    pub fn new(
        app_id: impl Into<String>,
        registry: Arc<MethodRegistry>,
        sink: Arc<dyn InstrumentationSink>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            registry,
            sink,
        }
    }

    /// Run the task in-process. Method failures come back as a `Failed`
    /// outcome, never as an error of the invoker.
    pub fn invoke(&self, task: &Task) -> InvocationOutcome {
        let probe = Probe {
            task_id: task.id,
            app_id: self.app_id.clone(),
            method: task.identity.method.clone(),
            location: ExecLocation::Local,
        };
        self.sink.start(&probe);

        let mut receiver = lock(&task.receiver);
        let started = Instant::now();
        let outcome = self
            .registry
            .invoke(&task.identity, &mut *receiver, &task.args);
        let pure = started.elapsed();
        drop(receiver);

        info!(
            task = task.id,
            method = %task.identity.method,
            ms = pure.as_secs_f64() * 1_000.0,
            "LOCAL invocation finished"
        );
        self.sink.stop(
            &probe,
            &Durations {
                pure_local_nanos: Some(nanos(pure)),
                ..Durations::default()
            },
        );
        outcome
    }
}
