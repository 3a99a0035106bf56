//! Network-quality estimates and the bounded wait for them to settle.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::queue::lock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkEstimates {
    pub rtt: Option<Duration>,
    pub upload_bps: Option<u64>,
    pub download_bps: Option<u64>,
}

impl NetworkEstimates {
    pub fn is_stable(&self) -> bool {
        self.rtt.is_some() && self.upload_bps.is_some() && self.download_bps.is_some()
    }
}

pub trait NetworkQuality: Send + Sync {
    fn current(&self) -> NetworkEstimates;

    /// Wait up to `ceiling` for all estimates to be known, then return
    /// whatever is available.
    fn wait_stable(&self, ceiling: Duration) -> NetworkEstimates;
}

/// No monitoring configured: estimates stay unknown and waits return at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmonitored;

impl NetworkQuality for Unmonitored {
    fn current(&self) -> NetworkEstimates {
        NetworkEstimates::default()
    }

    fn wait_stable(&self, _ceiling: Duration) -> NetworkEstimates {
        NetworkEstimates::default()
    }
}

/// Estimates published by an external profiler, with waiters notified on
/// every update.
#[derive(Debug, Default)]
pub struct NetworkMonitor {
    estimates: Mutex<NetworkEstimates>,
    changed: Condvar,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_rtt(&self, rtt: Duration) {
        self.update(|e| e.rtt = Some(rtt));
    }

    pub fn publish_upload(&self, bps: u64) {
        self.update(|e| e.upload_bps = Some(bps));
    }

    pub fn publish_download(&self, bps: u64) {
        self.update(|e| e.download_bps = Some(bps));
    }

    fn update(&self, f: impl FnOnce(&mut NetworkEstimates)) {
        let mut guard = lock(&self.estimates);
        f(&mut *guard);
        drop(guard);
        self.changed.notify_all();
    }
}

impl NetworkQuality for NetworkMonitor {
    fn current(&self) -> NetworkEstimates {
        *lock(&self.estimates)
    }

    fn wait_stable(&self, ceiling: Duration) -> NetworkEstimates {
        let guard = lock(&self.estimates);
        let (guard, timeout) = match self
            .changed
            .wait_timeout_while(guard, ceiling, |e| !e.is_stable())
        {
            Ok(res) => res,
            Err(poisoned) => poisoned.into_inner(),
        };
        if timeout.timed_out() && !guard.is_stable() {
            warn!(
                ceiling_ms = ceiling.as_millis() as u64,
                "network profiling did not settle, continuing with partial estimates"
            );
        } else {
            debug!(estimates = ?*guard, "network profiling settled");
        }
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_returns_once_all_estimates_arrive() {
        let monitor = Arc::new(NetworkMonitor::new());
        let publisher = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                monitor.publish_rtt(Duration::from_millis(12));
                monitor.publish_upload(1_000_000);
                monitor.publish_download(4_000_000);
            })
        };

        let started = Instant::now();
        let est = monitor.wait_stable(Duration::from_secs(5));
        publisher.join().unwrap();
        assert!(est.is_stable());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_gives_up_at_the_ceiling_with_partial_values() {
        let monitor = NetworkMonitor::new();
        monitor.publish_rtt(Duration::from_millis(5));
        let started = Instant::now();
        let est = monitor.wait_stable(Duration::from_millis(80));
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(est.rtt, Some(Duration::from_millis(5)));
        assert!(!est.is_stable());
    }
}
