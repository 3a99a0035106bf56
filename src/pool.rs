//! Fixed pool of long-lived workers, each owning one peer link, pulling
//! tasks from the shared queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::invocation::{ErrorKind, InvocationError, InvocationOutcome, MethodIdentity};
use crate::link::PeerLink;
use crate::queue::{lock, ConduitMap, Task, TaskQueue};
use crate::registry::SharedReceiver;

/// Builds a worker's link on the worker thread itself.
pub type LinkFactory = Box<dyn FnOnce() -> PeerLink + Send + 'static>;

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    conduits: Arc<ConduitMap>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

fn shutting_down() -> InvocationOutcome {
    InvocationOutcome::failed(InvocationError::new(
        ErrorKind::ShuttingDown,
        "offload engine is shutting down",
    ))
}

impl WorkerPool {
    /// Spawn one worker per link factory.
    pub fn spawn(links: Vec<LinkFactory>, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        if links.is_empty() {
            return Err(anyhow::anyhow!("worker pool needs at least one worker"));
        }
        let queue = Arc::new(TaskQueue::new());
        let conduits = Arc::new(ConduitMap::new());
        let size = links.len();

        let mut handles = Vec::with_capacity(size);
        for (index, make_link) in links.into_iter().enumerate() {
            let queue = Arc::clone(&queue);
            let conduits = Arc::clone(&conduits);
            let dispatcher = Arc::clone(&dispatcher);
            let handle = std::thread::Builder::new()
                .name(format!("offload-worker-{index}"))
                .spawn(move || run_worker(index, make_link, &queue, &conduits, &dispatcher))
                .with_context(|| format!("failed to spawn offload worker {index}"))?;
            handles.push(handle);
        }

        Ok(Self {
            queue,
            conduits,
            handles: Mutex::new(handles),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueue an invocation and block until its result is delivered.
    pub fn submit(
        &self,
        identity: MethodIdentity,
        args: Vec<Value>,
        receiver: SharedReceiver,
    ) -> InvocationOutcome {
        let (id, rx) = self.conduits.open();
        let task = Task {
            id,
            identity,
            args,
            receiver,
        };
        debug!(task = id, method = %task.identity, "adding task to the queue");
        if let Err(task) = self.queue.push(task) {
            self.conduits.fulfill(task.id, shutting_down());
        }

        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(task = id, "result conduit closed without a result");
                InvocationOutcome::failed(InvocationError::new(
                    ErrorKind::Internal,
                    "result conduit closed without a result",
                ))
            }
        }
    }

    /// Stop handing out tasks. Queued tasks are answered with `ShuttingDown`;
    /// a worker inside a remote exchange finishes it first.
    pub fn shutdown(&self) {
        let left = self.queue.close();
        if !left.is_empty() {
            warn!(count = left.len(), "failing queued tasks on shutdown");
        }
        for task in left {
            self.conduits.fulfill(task.id, shutting_down());
        }
    }

    /// Wait for every worker thread to exit. Call after `shutdown`.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for h in handles {
            if h.join().is_err() {
                error!("offload worker panicked");
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Closing the queue lets idle workers exit and drop their links. Workers
/// are not joined here, so a stuck remote exchange cannot hang the drop.
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    index: usize,
    make_link: LinkFactory,
    queue: &TaskQueue,
    conduits: &ConduitMap,
    dispatcher: &Dispatcher,
) {
    let mut link = make_link();
    info!(worker = index, state = ?link.state(), "worker started");

    while let Some(task) = queue.pop() {
        let id = task.id;
        debug!(worker = index, task = id, method = %task.identity, "got a task");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            dispatcher.dispatch(&task, &mut link)
        })) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(worker = index, task = id, "dispatch panicked");
                link.mark_broken();
                InvocationOutcome::failed(InvocationError::new(
                    ErrorKind::Panicked,
                    "dispatch panicked",
                ))
            }
        };
        if !conduits.fulfill(id, outcome) {
            warn!(worker = index, task = id, "result produced for a task with no conduit");
        }
    }
    info!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{self, Calculator};
    use crate::instrument::{InstrumentationSink, NoopSink};
    use crate::local::LocalInvoker;
    use crate::oracle::{ExecutionVerdict, FixedOracle};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn dispatcher() -> Arc<Dispatcher> {
        let sink: Arc<dyn InstrumentationSink> = Arc::new(NoopSink);
        let local = LocalInvoker::new("calc", Arc::new(demo::registry()), Arc::clone(&sink));
        Arc::new(Dispatcher::new(
            "calc",
            Arc::new(FixedOracle(ExecutionVerdict::Local)),
            local,
            sink,
        ))
    }

    fn offline_links(n: usize) -> Vec<LinkFactory> {
        (0..n)
            .map(|i| Box::new(move || PeerLink::offline(format!("w{i}"))) as LinkFactory)
            .collect()
    }

    #[test]
    fn submit_runs_on_a_worker() {
        let pool = WorkerPool::spawn(offline_links(2), dispatcher()).unwrap();
        let calc: SharedReceiver = Arc::new(Mutex::new(Calculator::new(0)));
        let outcome = pool.submit(Calculator::add(), vec![json!(4), json!(5)], calc);
        assert_eq!(outcome, InvocationOutcome::success(9));
        pool.shutdown();
        pool.join();
    }

    #[test]
    fn dropping_the_pool_stops_idle_workers() {
        let dispatcher = dispatcher();
        let pool = WorkerPool::spawn(offline_links(3), Arc::clone(&dispatcher)).unwrap();
        assert_eq!(Arc::strong_count(&dispatcher), 4);
        drop(pool);

        let until = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&dispatcher) > 1 && Instant::now() < until {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(Arc::strong_count(&dispatcher), 1, "workers still hold the dispatcher");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(WorkerPool::spawn(Vec::new(), dispatcher()).is_err());
    }
}
