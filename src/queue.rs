//! Shared task queue and the id-keyed result conduits.
//!
//! These are the only structures shared across threads: callers push tasks
//! and wait on their conduit, workers pop tasks and fulfil conduits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Condvar, Mutex, MutexGuard};

use serde_json::Value;

use crate::invocation::{InvocationOutcome, MethodIdentity};
use crate::registry::SharedReceiver;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Task {
    pub id: u64,
    pub identity: MethodIdentity,
    pub args: Vec<Value>,
    pub receiver: SharedReceiver,
}

struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Unbounded FIFO with blocking pop.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue a task. A closed queue hands the task back.
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a task is available. Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<Task> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            state = match self.ready.wait(state) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Close the queue, wake every waiter and return the tasks nobody took.
    pub fn close(&self) -> Vec<Task> {
        let mut state = lock(&self.state);
        state.closed = true;
        let left: Vec<Task> = state.tasks.drain(..).collect();
        drop(state);
        self.ready.notify_all();
        left
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-slot result handoffs keyed by task id.
pub struct ConduitMap {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, SyncSender<InvocationOutcome>>>,
}

impl Default for ConduitMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConduitMap {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh task id and its conduit.
    pub fn open(&self) -> (u64, Receiver<InvocationOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.slots).insert(id, tx);
        (id, rx)
    }

    /// Deliver the result for `id` and remove its conduit. Returns `false`
    /// when the conduit was already fulfilled or never existed.
    pub fn fulfill(&self, id: u64, outcome: InvocationOutcome) -> bool {
        let Some(tx) = lock(&self.slots).remove(&id) else {
            return false;
        };
        // A caller that stopped waiting is not an error for the worker.
        let _ = tx.send(outcome);
        true
    }

    pub fn pending(&self) -> usize {
        lock(&self.slots).len()
    }
}
