//! Per-task execution state machine.
//!
//! `DECIDE -> LOCAL_EXEC | REMOTE_EXEC -> DONE`, with
//! `REMOTE_EXEC -> LOCAL_FALLBACK -> DONE` on any remote failure.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::codec;
use crate::error::RemoteError;
use crate::instrument::{nanos, Durations, ExecLocation, InstrumentationSink, Probe};
use crate::invocation::{ErrorKind, InvocationError, InvocationOutcome};
use crate::link::PeerLink;
use crate::local::LocalInvoker;
use crate::oracle::{DecisionOracle, ExecutionVerdict};
use crate::queue::{lock, Task};

/// Where a task ends up after DECIDE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote,
    Unsupported,
}

pub struct Dispatcher {
    app_id: String,
    oracle: Arc<dyn DecisionOracle>,
    local: LocalInvoker,
    sink: Arc<dyn InstrumentationSink>,
}

impl Dispatcher {
    pub fn new(
        app_id: impl Into<String>,
        oracle: Arc<dyn DecisionOracle>,
        local: LocalInvoker,
        sink: Arc<dyn InstrumentationSink>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            oracle,
            local,
            sink,
        }
    }

    pub fn decide(&self, task: &Task) -> Route {
        match self.oracle.resolve(&self.app_id, &task.identity) {
            ExecutionVerdict::Local => Route::Local,
            ExecutionVerdict::Remote => Route::Remote,
            ExecutionVerdict::Dynamic => {
                warn!(task = task.id, method = %task.identity, "oracle left the verdict DYNAMIC, running locally");
                Route::Local
            }
            ExecutionVerdict::Hybrid => Route::Unsupported,
        }
    }

    /// Run one task to completion. Always produces an outcome.
    pub fn dispatch(&self, task: &Task, link: &mut PeerLink) -> InvocationOutcome {
        match self.decide(task) {
            Route::Unsupported => {
                error!(task = task.id, method = %task.identity, "HYBRID execution is not supported");
                InvocationOutcome::failed(InvocationError::new(
                    ErrorKind::Unsupported,
                    format!("HYBRID execution of {} is not supported", task.identity),
                ))
            }
            Route::Local => {
                debug!(task = task.id, "running the method locally");
                self.local.invoke(task)
            }
            Route::Remote => self.remote_or_fallback(task, link),
        }
    }

    fn remote_or_fallback(&self, task: &Task, link: &mut PeerLink) -> InvocationOutcome {
        let Some(channel) = link.channel_for_remote() else {
            debug!(task = task.id, "no ready channel, running locally");
            return self.local.invoke(task);
        };

        let mut receiver = lock(&task.receiver);
        let prep_started = Instant::now();
        let prepare_data_nanos = receiver
            .prepare_data()
            .then(|| nanos(prep_started.elapsed()));

        let probe = Probe {
            task_id: task.id,
            app_id: self.app_id.clone(),
            method: task.identity.method.clone(),
            location: ExecLocation::Remote,
        };
        self.sink.start(&probe);

        let started = Instant::now();
        let exchange =
            codec::execute_remote(channel, &task.identity, &task.args, &mut *receiver);
        drop(receiver);

        match exchange {
            Ok(container) => {
                let round_trip = started.elapsed();
                debug!(
                    task = task.id,
                    method = %task.identity.method,
                    ms = round_trip.as_secs_f64() * 1_000.0,
                    "REMOTE round trip finished"
                );
                self.sink.stop(
                    &probe,
                    &Durations {
                        prepare_data_nanos,
                        pure_remote_nanos: Some(container.pure_execution_nanos),
                        round_trip_nanos: Some(nanos(round_trip)),
                        ..Durations::default()
                    },
                );
                if let InvocationOutcome::Failed { error } = &container.function_result {
                    warn!(task = task.id, error = %error, "remote invocation failed, running the method locally");
                    return self.local.invoke(task);
                }
                container.function_result
            }
            Err(err) => {
                error!(task = task.id, method = %task.identity.method, error = %err, "REMOTE ERROR, running the method locally");
                if matches!(err, RemoteError::Protocol(_)) {
                    link.mark_broken();
                }
                self.local.invoke(task)
            }
        }
    }
}
