//! Least-loaded worker selection with a rotating tie-break.
//!
//! # How the choice is made (for beginners)
//!
//! Every worker has a load counter: the number of live connections it owns.
//! To place a new connection we scan all counters and take the smallest.
//! If we always scanned from worker 0, then with equal loads worker 0 would
//! always win the tie, and a pool that is mostly idle would pile everything
//! onto one thread.  So each scan starts one position further along than the
//! previous one (a *rotating cursor*), and ties go to whichever equal worker
//! the scan meets first.
//!
//! # Thread safety
//!
//! Several accept loops may place connections at the same time.  The counter
//! chosen by a scan is bumped with a compare-and-swap from the value the scan
//! observed; if another thread changed it in between, the scan is repeated.
//! As long as only acquisitions race, the winning counter was still the
//! minimum when it was bumped, so loads never drift more than one apart.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Identity of one I/O worker in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Tracks per-worker load and picks the least-loaded worker.
pub struct LoadBalancer {
    loads: Box<[AtomicUsize]>,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    /// Creates a balancer over `workers` workers (at least one).
    pub fn new(workers: usize) -> Self {
        let loads = (0..workers.max(1)).map(|_| AtomicUsize::new(0)).collect();
        Self {
            loads,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    /// Picks the least-loaded worker and counts one more connection on it.
    pub fn acquire(&self) -> WorkerId {
        let n = self.loads.len();
        loop {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let mut best = start;
            let mut best_load = self.loads[start].load(Ordering::Acquire);
            for step in 1..n {
                let index = (start + step) % n;
                let load = self.loads[index].load(Ordering::Acquire);
                if load < best_load {
                    best = index;
                    best_load = load;
                }
            }
            if self.loads[best]
                .compare_exchange(best_load, best_load + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return WorkerId(best);
            }
        }
    }

    /// Counts one more connection on a worker chosen by affinity.
    ///
    /// Out-of-range ids fall back to [`acquire`](Self::acquire).
    pub fn acquire_on(&self, worker: WorkerId) -> WorkerId {
        match self.loads.get(worker.0) {
            Some(load) => {
                load.fetch_add(1, Ordering::AcqRel);
                worker
            }
            None => self.acquire(),
        }
    }

    /// Counts one connection fewer on `worker`.  Never goes below zero.
    pub fn release(&self, worker: WorkerId) {
        if let Some(load) = self.loads.get(worker.0) {
            let _ = load.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }

    pub fn load(&self, worker: WorkerId) -> usize {
        self.loads
            .get(worker.0)
            .map_or(0, |l| l.load(Ordering::Acquire))
    }

    /// Snapshot of every worker's load, indexed by worker.
    pub fn loads(&self) -> Vec<usize> {
        self.loads.iter().map(|l| l.load(Ordering::Acquire)).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_uniform_load_visits_every_worker() {
        let balancer = LoadBalancer::new(4);
        let mut chosen: Vec<_> = (0..4).map(|_| balancer.acquire().index()).collect();
        chosen.sort_unstable();
        assert_eq!(chosen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_ties_rotate_instead_of_favouring_first_worker() {
        // Arrange: acquire and release so loads are always equal.
        let balancer = LoadBalancer::new(3);
        let mut seen = [false; 3];

        // Act
        for _ in 0..3 {
            let w = balancer.acquire();
            seen[w.index()] = true;
            balancer.release(w);
        }

        // Assert
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn test_least_loaded_worker_is_preferred() {
        let balancer = LoadBalancer::new(3);
        balancer.acquire_on(WorkerId::new(0));
        balancer.acquire_on(WorkerId::new(1));
        assert_eq!(balancer.acquire(), WorkerId::new(2));
    }

    #[test]
    fn test_release_never_underflows() {
        let balancer = LoadBalancer::new(1);
        balancer.release(WorkerId::new(0));
        assert_eq!(balancer.load(WorkerId::new(0)), 0);
    }

    #[test]
    fn test_acquire_on_out_of_range_falls_back() {
        let balancer = LoadBalancer::new(2);
        let w = balancer.acquire_on(WorkerId::new(7));
        assert!(w.index() < 2);
        assert_eq!(balancer.loads().iter().sum::<usize>(), 1);
    }

    #[test]
    fn test_concurrent_acquires_keep_spread_within_one() {
        // Arrange
        let balancer = Arc::new(LoadBalancer::new(4));

        // Act: 8 threads × 125 acquisitions = 1000 placements.
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&balancer);
                thread::spawn(move || {
                    for _ in 0..125 {
                        b.acquire();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Assert
        let loads = balancer.loads();
        assert_eq!(loads.iter().sum::<usize>(), 1000);
        let spread = loads.iter().max().unwrap() - loads.iter().min().unwrap();
        assert!(spread <= 1, "loads {loads:?} spread {spread}");
    }

    #[test]
    fn test_zero_workers_is_clamped_to_one() {
        let balancer = LoadBalancer::new(0);
        assert_eq!(balancer.len(), 1);
        assert_eq!(balancer.acquire(), WorkerId::new(0));
    }
}
