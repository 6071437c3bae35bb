//! Dedicated single-thread executor for work that must never block a worker.
//!
//! Unbinding may be triggered from inside a callback of the very connection
//! being torn down.  If that unbind ran on the connection's worker and waited
//! for the listener to close, it could wait on itself.  Instead, unbinds are
//! queued here and run one at a time, in submission order, on a thread of
//! their own.
//!
//! Once [`shutdown`](SerialExecutor::shutdown) has been called,
//! [`submit`](SerialExecutor::submit) returns `None` so callers can answer
//! with an already-completed no-op instead of blocking.

use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Task = BoxFuture<'static, ()>;

/// Runs submitted futures sequentially on a dedicated thread.
pub struct SerialExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Starts the executor thread.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime or thread cannot be created.
    pub fn new(name: &str) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let thread_name = name.to_string();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            runtime.block_on(async move {
                while let Some(task) = rx.recv().await {
                    task.await;
                }
            });
            debug!(executor = %thread_name, "serial executor stopped");
        })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `future`; returns a receiver for its output, or `None` after shutdown.
    pub fn submit<F, T>(&self, future: F) -> Option<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.tx.lock();
        let tx = guard.as_ref()?;
        let (done_tx, done_rx) = oneshot::channel();
        let task = async move {
            let _ = done_tx.send(future.await);
        }
        .boxed();
        tx.send(task).ok()?;
        Some(done_rx)
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stops accepting work, lets queued work finish, and joins the thread.
    ///
    /// Blocking; idempotent.  Skips the join when called from the executor
    /// thread itself.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("serial executor thread panicked");
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        // Arrange
        let executor = SerialExecutor::new("test-serial").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Act
        let receivers: Vec<_> = (0..5)
            .map(|i| {
                let log = Arc::clone(&log);
                executor
                    .submit(async move {
                        tokio::task::yield_now().await;
                        log.lock().push(i);
                        i * 10
                    })
                    .unwrap()
            })
            .collect();
        let mut outputs = Vec::new();
        for rx in receivers {
            outputs.push(rx.await.unwrap());
        }

        // Assert
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(outputs, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn test_submit_after_shutdown_returns_none() {
        let executor = SerialExecutor::new("test-serial").unwrap();
        executor.shutdown();
        assert!(executor.is_shutdown());
        assert!(executor.submit(async {}).is_none());
    }
}
