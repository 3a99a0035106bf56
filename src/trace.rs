use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::instrument::{Durations, ExecLocation, InstrumentationSink, Probe};
use crate::queue::lock;

/// In-memory instrumentation sink recording one event per start/stop.
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    inner: Mutex<TraceState>,
}

#[derive(Debug, Default)]
struct TraceState {
    events: Vec<TraceEvent>,
    started_ms: HashMap<(u64, ExecLocation), u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    ExecutionStarted {
        ts_ms: u128,
        task_id: u64,
        method: String,
        location: ExecLocation,
    },
    ExecutionFinished {
        ts_ms: u128,
        task_id: u64,
        method: String,
        location: ExecLocation,
        elapsed_ms: u128,
        durations: Durations,
    },
}

impl TraceEvent {
    pub fn summarize(&self) -> String {
        match self {
            TraceEvent::ExecutionStarted {
                ts_ms,
                task_id,
                method,
                location,
            } => format!(
                "{ts_ms} ExecutionStarted task={task_id} method={method} location={}",
                location.as_str()
            ),
            TraceEvent::ExecutionFinished {
                ts_ms,
                task_id,
                method,
                location,
                elapsed_ms,
                durations,
            } => {
                let pure = durations
                    .pure_local_nanos
                    .or(durations.pure_remote_nanos)
                    .map(format_nanos)
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "{ts_ms} ExecutionFinished task={task_id} method={method} location={} elapsed_ms={elapsed_ms} pure={pure}",
                    location.as_str()
                )
            }
        }
    }
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        lock(&self.inner).events.clone()
    }

    /// Finished executions at `location`.
    pub fn finished_at(&self, location: ExecLocation) -> usize {
        lock(&self.inner)
            .events
            .iter()
            .filter(|ev| {
                matches!(ev, TraceEvent::ExecutionFinished { location: l, .. } if *l == location)
            })
            .count()
    }

    /// Executions that started at `location` but never finished there, e.g.
    /// remote attempts that fell back.
    pub fn abandoned_at(&self, location: ExecLocation) -> usize {
        lock(&self.inner)
            .started_ms
            .keys()
            .filter(|(_, l)| *l == location)
            .count()
    }
}

impl InstrumentationSink for ExecutionTrace {
    fn start(&self, probe: &Probe) {
        let ts_ms = Self::now_ms();
        let mut state = lock(&self.inner);
        state.events.push(TraceEvent::ExecutionStarted {
            ts_ms,
            task_id: probe.task_id,
            method: probe.method.clone(),
            location: probe.location,
        });
        state
            .started_ms
            .insert((probe.task_id, probe.location), ts_ms);
    }

    fn stop(&self, probe: &Probe, durations: &Durations) {
        let ts_ms = Self::now_ms();
        let mut state = lock(&self.inner);
        let elapsed_ms = state
            .started_ms
            .remove(&(probe.task_id, probe.location))
            .map(|started| ts_ms.saturating_sub(started))
            .unwrap_or(0);
        state.events.push(TraceEvent::ExecutionFinished {
            ts_ms,
            task_id: probe.task_id,
            method: probe.method.clone(),
            location: probe.location,
            elapsed_ms,
            durations: *durations,
        });
    }
}

/// Print a human-readable trace to stdout (stable + diff-friendly).
pub fn print_trace(tr: &ExecutionTrace) {
    let events = tr.events();
    println!("TRACE events={}", events.len());
    for ev in &events {
        println!("{}", ev.summarize());
    }
}

fn format_nanos(nanos: u64) -> String {
    let ms = nanos as f64 / 1_000_000.0;
    format!("{ms:.3}ms")
}
