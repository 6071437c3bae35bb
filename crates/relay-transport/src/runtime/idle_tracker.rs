//! One shared timer that watches every session for inactivity.
//!
//! # How it works (for beginners)
//!
//! Giving each connection its own timer gets expensive with tens of
//! thousands of connections.  Instead a single task wakes up every
//! `idle_tick` (100 ms by default), walks the list of tracked sessions and
//! asks each one which idle notifications are due.  Due notifications are
//! posted to the session's own worker, so `session_idle` runs on the same
//! thread as every other callback of that session.
//!
//! Sessions are added and removed by sending commands over a channel.  The
//! tracker applies pending commands at the start of each tick, never in the
//! middle of a scan.
//!
//! Idle events are only notifications.  Closing an idle session is up to the
//! handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::domain::session::{Session, SessionId, SessionState};

enum TrackerCommand {
    Add(Session),
    Remove(SessionId),
}

struct TrackerInner {
    tx: mpsc::UnboundedSender<TrackerCommand>,
    stop: watch::Sender<bool>,
    tracked: Arc<AtomicUsize>,
}

/// Handle to the shared idle timer.  Cheap to clone.
#[derive(Clone)]
pub struct IdleTracker {
    inner: Arc<TrackerInner>,
}

impl IdleTracker {
    /// Starts the tracker task on `runtime`, checking every `tick`.
    pub fn start(runtime: &Handle, tick: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let tracked = Arc::new(AtomicUsize::new(0));
        runtime.spawn(run(rx, stop_rx, tick, Arc::clone(&tracked)));
        debug!(tick_ms = tick.as_millis() as u64, "idle tracker started");
        Self {
            inner: Arc::new(TrackerInner { tx, stop, tracked }),
        }
    }

    /// Starts watching `session` (the root of a stack).
    pub fn add(&self, session: &Session) {
        let _ = self.inner.tx.send(TrackerCommand::Add(session.clone()));
    }

    pub fn remove(&self, id: SessionId) {
        let _ = self.inner.tx.send(TrackerCommand::Remove(id));
    }

    /// Sessions watched as of the last tick.
    pub fn tracked(&self) -> usize {
        self.inner.tracked.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        let _ = self.inner.stop.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<TrackerCommand>,
    mut stop: watch::Receiver<bool>,
    tick: Duration,
    tracked: Arc<AtomicUsize>,
) {
    let mut sessions: HashMap<SessionId, Session> = HashMap::new();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }

        loop {
            match rx.try_recv() {
                Ok(TrackerCommand::Add(session)) => {
                    sessions.insert(session.id(), session);
                }
                Ok(TrackerCommand::Remove(id)) => {
                    sessions.remove(&id);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("idle tracker handle dropped");
                    return;
                }
            }
        }

        sessions.retain(|_, s| s.state() != SessionState::Closed);
        tracked.store(sessions.len(), Ordering::Relaxed);

        let now = Instant::now();
        for session in sessions.values() {
            let due = session.collect_idle(now);
            if due.is_empty() {
                continue;
            }
            let posted = session.worker_handle().execute(move |cx| {
                for (target, event) in due {
                    trace!(
                        session = %target.id(),
                        status = ?event.status,
                        count = event.idle_count,
                        "session idle"
                    );
                    target.fire_idle(cx, event);
                }
            });
            if posted.is_err() {
                trace!(session = %session.id(), "worker gone; idle notification dropped");
            }
        }
    }
    debug!("idle tracker stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_is_observable() {
        let tracker = IdleTracker::start(&Handle::current(), Duration::from_millis(10));
        assert!(!tracker.is_stopped());
        tracker.stop();
        assert!(tracker.is_stopped());
    }

    #[tokio::test]
    async fn test_empty_tracker_reports_zero() {
        let tracker = IdleTracker::start(&Handle::current(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.tracked(), 0);
        tracker.stop();
    }
}
