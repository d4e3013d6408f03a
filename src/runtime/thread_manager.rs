//! Centralized supervisor for the engine's worker threads.
//!
//! Every long-running piece of the pipeline (book feeds, balance trackers,
//! the beat-driven main loop) is attached here by name. Worker failures
//! propagate to a single termination channel; any unexpected termination
//! takes the whole process down with exit code 1.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info};

type Worker = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Termination {
    name: String,
    /// `None` for a clean exit of a worker that was expected to terminate.
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Running,
    Finished,
}

struct Pending {
    name: String,
    worker: Worker,
    terminates: bool,
}

struct Inner {
    tx: Sender<Termination>,
    rx: Receiver<Termination>,
    pending: Mutex<Vec<Pending>>,
    state: Mutex<State>,
    finite_count: Mutex<usize>,
}

/// Supervises named worker threads. Cheap to clone; adapters keep a clone so
/// they can attach their I/O workers.
#[derive(Clone)]
pub struct ThreadManager {
    inner: Arc<Inner>,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                pending: Mutex::new(Vec::new()),
                state: Mutex::new(State::Initialized),
                finite_count: Mutex::new(0),
            }),
        }
    }

    /// Registers a named worker. Before `run` the worker is queued; after
    /// `run` it starts immediately. `terminates` declares whether a clean
    /// exit is expected (finite worker) or fatal (supposed to run forever).
    pub fn attach<F>(&self, name: impl Into<String>, worker: F, terminates: bool) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let state = *self.inner.state.lock();
        if state == State::Finished {
            anyhow::bail!("thread manager has finished, cannot attach {name:?}");
        }
        if terminates {
            *self.inner.finite_count.lock() += 1;
        }
        let pending = Pending {
            name,
            worker: Box::new(worker),
            terminates,
        };
        if state == State::Initialized {
            self.inner.pending.lock().push(pending);
        } else {
            self.spawn(pending);
        }
        Ok(())
    }

    fn spawn(&self, pending: Pending) {
        let Pending {
            name,
            worker,
            terminates,
        } = pending;
        let tx = self.inner.tx.clone();
        let thread_name = name.clone();
        let body = move || {
            let outcome = catch_unwind(AssertUnwindSafe(worker));
            let error = match outcome {
                Ok(Ok(())) => {
                    if terminates {
                        None
                    } else {
                        Some("expected worker to run forever".to_string())
                    }
                }
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(panic_message(panic)),
            };
            let _ = tx.send(Termination { name, error });
        };
        // The spawn handle is dropped on purpose: lifecycle is tracked
        // through the termination channel, and remaining workers die with
        // the process.
        if let Err(e) = thread::Builder::new().name(thread_name.clone()).spawn(body) {
            let _ = self.inner.tx.send(Termination {
                name: thread_name,
                error: Some(format!("failed to spawn thread: {e}")),
            });
        }
    }

    /// Takes over the calling thread: starts every registered worker, then
    /// blocks on the termination channel until all finite workers have
    /// exited cleanly. Any worker error, or a clean exit of a worker that
    /// was supposed to run forever, is fatal and exits the process.
    pub fn run(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                State::Initialized => *state = State::Running,
                State::Running => anyhow::bail!("thread manager is already running"),
                State::Finished => anyhow::bail!("thread manager has finished"),
            }
        }
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for p in pending {
            self.spawn(p);
        }

        let mut completed = 0usize;
        loop {
            let Termination { name, error } = self
                .inner
                .rx
                .recv()
                .expect("termination channel cannot close while manager holds a sender");
            match error {
                None => {
                    completed += 1;
                    info!(worker = %name, "worker terminated");
                    if completed == *self.inner.finite_count.lock() {
                        *self.inner.state.lock() = State::Finished;
                        return Ok(());
                    }
                }
                Some(trace) => {
                    error!(worker = %name, "worker terminated unexpectedly!\n{trace}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
