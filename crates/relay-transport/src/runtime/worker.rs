//! One I/O worker: an OS thread running a single-threaded Tokio runtime.
//!
//! # Why a thread per worker? (for beginners)
//!
//! Tokio's default multi-threaded runtime moves tasks between threads
//! whenever it likes.  The gateway needs the opposite guarantee: a connection
//! and every session layered on it must always run on the *same* thread, so
//! their callbacks never race each other.  Each worker therefore owns a
//! `current_thread` runtime and a [`LocalSet`]; work is sent to the worker
//! over a channel and spawned there as a local task, which Tokio never
//! migrates.
//!
//! # The worker capability
//!
//! Code running on a worker receives a [`WorkerContext`].  It is `!Send`, so
//! it cannot be smuggled to another thread, and it is only ever created by
//! the worker loop itself.  Session operations that mutate state take a
//! `&WorkerContext` and compare its identity with the session's owner, which
//! turns a cross-thread mutation into an immediate, loud error instead of a
//! data race.

use std::fmt;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::rc::Rc;
use std::thread::{self, JoinHandle, ThreadId};

use futures_util::future::{FutureExt, LocalBoxFuture};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, trace};

use relay_core::affinity::WorkerId;

/// Returned when work is sent to a worker that has already stopped.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{0} has stopped")]
pub struct WorkerStopped(pub WorkerId);

type Job = Box<dyn FnOnce(WorkerContext) -> LocalBoxFuture<'static, ()> + Send>;

enum WorkerMessage {
    Run(Job),
    Stop,
}

/// Proof that the current code runs on a particular worker thread.
///
/// Cheap to clone within the worker; cannot leave it.
#[derive(Clone)]
pub struct WorkerContext {
    handle: WorkerHandle,
    _not_send: PhantomData<Rc<()>>,
}

impl WorkerContext {
    fn new(handle: WorkerHandle) -> Self {
        Self {
            handle,
            _not_send: PhantomData,
        }
    }

    /// Identity of the worker this code is running on.
    pub fn worker(&self) -> WorkerId {
        self.handle.id
    }

    /// A sendable handle to this worker, for posting work back to it later.
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Spawns a task on this worker.  The task never leaves this thread.
    pub fn spawn_local<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker", &self.handle.id)
            .finish()
    }
}

/// Sendable handle used to post work to a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Runs `job` as a local task on the worker.
    ///
    /// # Errors
    ///
    /// [`WorkerStopped`] if the worker has shut down.
    pub fn spawn<F, Fut>(&self, job: F) -> Result<(), WorkerStopped>
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let job: Job = Box::new(move |cx| job(cx).boxed_local());
        self.tx
            .send(WorkerMessage::Run(job))
            .map_err(|_| WorkerStopped(self.id))
    }

    /// Runs a synchronous closure on the worker.
    ///
    /// # Errors
    ///
    /// [`WorkerStopped`] if the worker has shut down.
    pub fn execute<F>(&self, f: F) -> Result<(), WorkerStopped>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        self.spawn(move |cx| async move { f(&cx) })
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.id).finish()
    }
}

/// Owning side of a worker: the handle plus the thread to join.
pub struct WorkerThread {
    handle: WorkerHandle,
    thread: JoinHandle<()>,
}

impl WorkerThread {
    /// Starts worker `id` on a new OS thread.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime or the thread cannot be created.
    pub fn start(id: WorkerId) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle { id, tx };
        let thread_handle = handle.clone();
        let thread = thread::Builder::new()
            .name(format!("relay-{id}"))
            .spawn(move || run(thread_handle, runtime, rx))?;
        Ok(Self { handle, thread })
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    /// Asks the worker to stop after the work already queued.
    pub fn stop(&self) {
        let _ = self.handle.tx.send(WorkerMessage::Stop);
    }

    /// Stops the worker and waits for its thread, unless called from it.
    pub fn join(self) {
        self.stop();
        if thread::current().id() == self.thread_id() {
            return;
        }
        if self.thread.join().is_err() {
            tracing::error!(worker = %self.handle.id, "worker thread panicked");
        }
    }
}

fn run(
    handle: WorkerHandle,
    runtime: tokio::runtime::Runtime,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let id = handle.id;
    debug!(worker = %id, "worker started");
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Run(job) => {
                    tokio::task::spawn_local(job(WorkerContext::new(handle.clone())));
                }
                WorkerMessage::Stop => break,
            }
        }
        rx.close();
        trace!(worker = %id, "worker loop finished");
    });
    // Dropping the LocalSet drops any tasks still parked on it.
    drop(local);
    debug!(worker = %id, "worker stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
