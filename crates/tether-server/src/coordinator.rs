//! Single-threaded execution coordinator.
//!
//! The script engine is not thread-safe, so exactly one OS thread owns it.
//! Everything else (accept loops, session readers and writers, timers) talks
//! to the engine by submitting tasks to that thread through an unbounded
//! channel. Tasks run one at a time, in the order they were enqueued, and a
//! task may submit more tasks; those are appended to the tail of the queue and
//! never run inline.
//!
//! # Architecture
//!
//! ```text
//! accept loop ─┐
//! read loop ───┼──► mpsc (FIFO) ──► coordinator thread ──► &mut S
//! timers ──────┘                    (catch_unwind per task)
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use tether_common::{Result, TetherError};
use tether_metrics::MetricsRegistry;
use tokio::sync::{mpsc, oneshot};

/// A unit of work run on the coordinator thread with exclusive access to the
/// script state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// What happens when a task panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Log the panic and terminate the process with exit code 1.
    #[default]
    Exit,
    /// Log the panic, mark the coordinator faulted and stop the worker.
    Halt,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub thread_name: String,
    pub fault_policy: FaultPolicy,
    pub metrics: Arc<MetricsRegistry>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            thread_name: "tether-coordinator".to_string(),
            fault_policy: FaultPolicy::Exit,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Point-in-time view of coordinator activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub submitted: u64,
    pub executed: u64,
    pub queued: u64,
    pub busy_ns: u64,
    pub faulted: bool,
}

enum Message<S> {
    Run(Task<S>),
    Stop,
}

struct Shared {
    worker: OnceLock<ThreadId>,
    faulted: AtomicBool,
    stopped: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

/// Cloneable, thread-safe entry point for submitting work.
pub struct CoordinatorHandle<S> {
    tx: mpsc::UnboundedSender<Message<S>>,
    shared: Arc<Shared>,
}

impl<S> Clone for CoordinatorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: 'static> CoordinatorHandle<S> {
    /// Enqueues a task. Never blocks and never runs the task inline, even when
    /// called from inside another task.
    ///
    /// # Errors
    ///
    /// Returns `TetherError::CoordinatorStopped` once the worker has exited.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(TetherError::CoordinatorStopped);
        }

        self.tx
            .send(Message::Run(Box::new(task)))
            .map_err(|_| TetherError::CoordinatorStopped)?;
        self.shared.metrics.record_task_submitted();
        Ok(())
    }

    /// Runs `f` on the coordinator and blocks until it returns.
    ///
    /// Must not be called from an async context; use [`call_async`] there.
    ///
    /// # Errors
    ///
    /// - `TetherError::Reentrant` if called from the coordinator thread itself
    /// - `TetherError::CoordinatorStopped` if the task never ran
    ///
    /// [`call_async`]: CoordinatorHandle::call_async
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_coordinator_thread() {
            return Err(TetherError::Reentrant);
        }

        let (tx, rx) = oneshot::channel();
        self.submit(move |state| {
            let _ = tx.send(f(state));
        })?;

        rx.blocking_recv().map_err(|_| TetherError::CoordinatorStopped)
    }

    /// Runs `f` on the coordinator and waits for its result asynchronously.
    pub async fn call_async<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |state| {
            let _ = tx.send(f(state));
        })?;

        rx.await.map_err(|_| TetherError::CoordinatorStopped)
    }

    /// Enqueues a stop marker. Tasks submitted before it still run.
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    pub fn is_coordinator_thread(&self) -> bool {
        self.shared.worker.get() == Some(&thread::current().id())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.shared.metrics
    }

    pub fn stats(&self) -> CoordinatorStats {
        let snapshot = self.shared.metrics.snapshot();
        CoordinatorStats {
            submitted: snapshot.tasks_submitted,
            executed: snapshot.tasks_executed,
            queued: snapshot.tasks_queued,
            busy_ns: snapshot.busy_ns,
            faulted: self.shared.faulted.load(Ordering::Acquire),
        }
    }
}

/// Owner of the coordinator thread.
pub struct Coordinator<S> {
    handle: CoordinatorHandle<S>,
    thread: Option<JoinHandle<()>>,
}

impl<S: 'static> Coordinator<S> {
    /// Starts the coordinator thread.
    ///
    /// `factory` runs on the new thread and builds the state the tasks will
    /// operate on, so `S` does not need to be `Send`. It receives a handle for
    /// scheduling follow-up work from inside tasks.
    ///
    /// # Errors
    ///
    /// Returns the factory's error, or `TetherError::Io` if the thread could
    /// not be spawned.
    pub fn spawn<F>(config: CoordinatorConfig, factory: F) -> Result<Self>
    where
        F: FnOnce(&CoordinatorHandle<S>) -> Result<S> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            worker: OnceLock::new(),
            faulted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics: Arc::clone(&config.metrics),
        });
        let handle = CoordinatorHandle { tx, shared };

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let worker_handle = handle.clone();
        let policy = config.fault_policy;

        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let _ = worker_handle.shared.worker.set(thread::current().id());

                let state = match factory(&worker_handle) {
                    Ok(state) => {
                        let _ = ready_tx.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        worker_handle.shared.stopped.store(true, Ordering::Release);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                run_worker(state, rx, &worker_handle.shared, policy);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(TetherError::CoordinatorStopped);
            }
        }

        tracing::debug!("Coordinator thread '{}' started", config.thread_name);

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> CoordinatorHandle<S> {
        self.handle.clone()
    }

    /// Stops the coordinator and waits for the worker thread to exit.
    pub fn shutdown(mut self) {
        self.handle.stop();
        self.join_worker();
    }

    /// Waits for the worker thread to exit without requesting a stop.
    pub fn join(mut self) {
        self.join_worker();
    }

    fn join_worker(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Coordinator thread terminated abnormally");
            }
        }
    }
}

fn run_worker<S>(
    mut state: S,
    mut rx: mpsc::UnboundedReceiver<Message<S>>,
    shared: &Shared,
    policy: FaultPolicy,
) {
    while let Some(message) = rx.blocking_recv() {
        let task = match message {
            Message::Run(task) => task,
            Message::Stop => break,
        };

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&mut state)));
        shared.metrics.record_task_executed(started.elapsed());

        if let Err(payload) = outcome {
            tracing::error!("Coordinator task panicked: {}", panic_message(&payload));
            shared.faulted.store(true, Ordering::Release);
            match policy {
                FaultPolicy::Exit => std::process::exit(1),
                FaultPolicy::Halt => break,
            }
        }
    }

    shared.stopped.store(true, Ordering::Release);
    rx.close();
    // Tasks that raced the stop marker are dropped here, which wakes any
    // caller waiting on their completion with `CoordinatorStopped`.
    while rx.try_recv().is_ok() {}

    drop(state);
    tracing::debug!("Coordinator thread exited");
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
