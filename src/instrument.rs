//! Fire-and-forget execution instrumentation.

use std::time::Duration;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecLocation {
    Local,
    Remote,
}

impl ExecLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecLocation::Local => "LOCAL",
            ExecLocation::Remote => "REMOTE",
        }
    }
}

/// What is being measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub task_id: u64,
    pub app_id: String,
    pub method: String,
    pub location: ExecLocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Durations {
    pub pure_local_nanos: Option<u64>,
    pub prepare_data_nanos: Option<u64>,
    /// Execution time reported by the peer.
    pub pure_remote_nanos: Option<u64>,
    pub round_trip_nanos: Option<u64>,
}

pub fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

pub trait InstrumentationSink: Send + Sync {
    fn start(&self, probe: &Probe);
    fn stop(&self, probe: &Probe, durations: &Durations);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl InstrumentationSink for NoopSink {
    fn start(&self, _probe: &Probe) {}
    fn stop(&self, _probe: &Probe, _durations: &Durations) {}
}

/// Emits each measurement as a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl InstrumentationSink for LogSink {
    fn start(&self, _probe: &Probe) {}

    fn stop(&self, probe: &Probe, d: &Durations) {
        info!(
            task = probe.task_id,
            app = %probe.app_id,
            method = %probe.method,
            location = probe.location.as_str(),
            pure_local_nanos = ?d.pure_local_nanos,
            prepare_data_nanos = ?d.prepare_data_nanos,
            pure_remote_nanos = ?d.pure_remote_nanos,
            round_trip_nanos = ?d.round_trip_nanos,
            "execution measured"
        );
    }
}
