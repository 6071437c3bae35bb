//! Fixed-size pool of I/O workers with least-loaded placement and affinity.
//!
//! The pool is an ordinary value: the transport service constructs it,
//! hands `Arc`s of it to the acceptors and connectors that need it, and
//! shuts it down in `dispose`.
//!
//! # Placement
//!
//! [`AffinityPool::next_worker`] takes an optional affinity hint:
//!
//! - `Some(worker)`: the caller is already running on behalf of a
//!   connection owned by `worker` (e.g. a relay opening its backend
//!   connection from inside a handler).  The new connection goes to the same
//!   worker, so both ends share one thread.
//! - `None`: the least-loaded worker is chosen (see [`LoadBalancer`]).
//!
//! Either way the caller receives a [`WorkerLease`].  The lease counts as
//! one unit of load until it is dropped, which the session does when it
//! closes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use relay_core::affinity::{LoadBalancer, WorkerId};

use super::worker::{WorkerHandle, WorkerThread};

/// One unit of load on a worker, released on drop.
pub struct WorkerLease {
    worker: WorkerHandle,
    balancer: Arc<LoadBalancer>,
}

impl WorkerLease {
    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn id(&self) -> WorkerId {
        self.worker.id()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.balancer.release(self.worker.id());
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker.id())
            .finish()
    }
}

/// Explicitly owned pool of I/O worker threads.
pub struct AffinityPool {
    handles: Vec<WorkerHandle>,
    threads: Mutex<Vec<WorkerThread>>,
    balancer: Arc<LoadBalancer>,
    stopped: AtomicBool,
}

impl AffinityPool {
    /// Starts `size` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns the I/O error if a worker thread cannot be started; workers
    /// already started are stopped again.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            match WorkerThread::start(WorkerId::new(index)) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    for started in threads {
                        started.join();
                    }
                    return Err(e);
                }
            }
        }
        let handles = threads.iter().map(|t| t.handle().clone()).collect();
        info!(workers = size, "affinity pool started");
        Ok(Self {
            handles,
            threads: Mutex::new(threads),
            balancer: Arc::new(LoadBalancer::new(size)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.handles.get(id.index())
    }

    /// Picks a worker for a new connection, honouring `affinity` if given.
    pub fn next_worker(&self, affinity: Option<WorkerId>) -> WorkerLease {
        let id = match affinity {
            Some(id) => self.balancer.acquire_on(id),
            None => self.balancer.acquire(),
        };
        WorkerLease {
            worker: self.handles[id.index()].clone(),
            balancer: Arc::clone(&self.balancer),
        }
    }

    /// Live connections per worker, indexed by worker.
    pub fn loads(&self) -> Vec<usize> {
        self.balancer.loads()
    }

    pub fn total_load(&self) -> usize {
        self.loads().iter().sum()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops every worker and joins their threads.
    ///
    /// Blocking; call from a blocking context.  Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in &threads {
            thread.stop();
        }
        for thread in threads {
            thread.join();
        }
        info!("affinity pool stopped");
    }
}

impl Drop for AffinityPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_lease_counts_load_until_dropped() {
        let pool = AffinityPool::new(2).unwrap();
        let lease = pool.next_worker(None);
        assert_eq!(pool.total_load(), 1);
        drop(lease);
        assert_eq!(pool.total_load(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_affinity_hint_pins_worker() {
        // Arrange
        let pool = AffinityPool::new(4).unwrap();
        let first = pool.next_worker(None);

        // Act
        let pinned: Vec<_> = (0..5).map(|_| pool.next_worker(Some(first.id()))).collect();

        // Assert
        assert!(pinned.iter().all(|l| l.id() == first.id()));
        assert_eq!(pool.loads()[first.id().index()], 6);
        drop(pinned);
        drop(first);
        pool.shutdown();
    }

    #[test]
    fn test_thousand_placements_stay_balanced() {
        let pool = AffinityPool::new(4).unwrap();
        let leases: Vec<_> = (0..1000).map(|_| pool.next_worker(None)).collect();
        assert_eq!(pool.loads(), vec![250, 250, 250, 250]);
        drop(leases);
        pool.shutdown();
    }

    #[test]
    fn test_lease_worker_runs_jobs() {
        let pool = AffinityPool::new(2).unwrap();
        let lease = pool.next_worker(None);
        let expected = lease.id();
        let (tx, rx) = mpsc::channel();
        lease
            .worker()
            .execute(move |cx| tx.send(cx.worker()).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        pool.shutdown();
        assert!(pool.is_stopped());
        assert!(lease.worker().is_stopped());
    }
}
