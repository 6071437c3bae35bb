//! Pure idle-detection rules, evaluated by the runtime's periodic tick.
//!
//! # Deadline rule
//!
//! For each [`IdleStatus`] with a threshold `T`, a notification is due when
//!
//! ```text
//! now >= max(last_io, last_notification) + T
//! ```
//!
//! where `last_io` is the last read (reader idle), the last write (writer
//! idle) or the later of both (both idle).  Two consequences:
//!
//! - a notification is never repeated within the same window, because firing
//!   moves `last_notification` to `now`;
//! - I/O recorded at or before the tick that would have fired pushes the
//!   deadline out by a full `T`, so that tick stays silent.  I/O after a
//!   notification starts a fresh window rather than extending the old one.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::address::ResourceOptions;

/// Which direction of traffic has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdleStatus {
    ReaderIdle,
    WriterIdle,
    BothIdle,
}

impl IdleStatus {
    pub const ALL: [IdleStatus; 3] = [Self::ReaderIdle, Self::WriterIdle, Self::BothIdle];

    fn index(self) -> usize {
        match self {
            Self::ReaderIdle => 0,
            Self::WriterIdle => 1,
            Self::BothIdle => 2,
        }
    }
}

/// Per-direction idle thresholds.  `None` disables a direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleConfig {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub both: Option<Duration>,
}

impl IdleConfig {
    /// Thresholds carried by an address's options.
    pub fn from_options(options: &ResourceOptions) -> Self {
        Self {
            read: options.read_idle,
            write: options.write_idle,
            both: options.both_idle,
        }
    }

    pub fn get(&self, status: IdleStatus) -> Option<Duration> {
        match status {
            IdleStatus::ReaderIdle => self.read,
            IdleStatus::WriterIdle => self.write,
            IdleStatus::BothIdle => self.both,
        }
    }

    pub fn set(&mut self, status: IdleStatus, threshold: Option<Duration>) {
        // A zero threshold would fire on every tick; treat it as disabled.
        let threshold = threshold.filter(|t| !t.is_zero());
        match status {
            IdleStatus::ReaderIdle => self.read = threshold,
            IdleStatus::WriterIdle => self.write = threshold,
            IdleStatus::BothIdle => self.both = threshold,
        }
    }

    /// Fills in directions this config leaves unset from `fallback`.
    pub fn or(self, fallback: IdleConfig) -> Self {
        Self {
            read: self.read.or(fallback.read),
            write: self.write.or(fallback.write),
            both: self.both.or(fallback.both),
        }
    }

    /// Per direction, the smaller of the two enabled thresholds.
    ///
    /// A parent connection measures I/O on behalf of every session layered on
    /// it, so it must watch with the tightest threshold any of them asked for.
    pub fn merge_min(self, other: IdleConfig) -> Self {
        fn min(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        }
        Self {
            read: min(self.read, other.read),
            write: min(self.write, other.write),
            both: min(self.both, other.both),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.read.is_some() || self.write.is_some() || self.both.is_some()
    }
}

/// One idle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvent {
    pub status: IdleStatus,
    /// Consecutive notifications of this status without intervening I/O.
    pub idle_count: u64,
}

/// Notification bookkeeping for one session.
#[derive(Debug, Clone, Default)]
pub struct IdleWindow {
    last_notified: [Option<Instant>; 3],
    counts: [u64; 3],
}

impl IdleWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the notifications due at `now` and records them as sent.
    pub fn poll(
        &mut self,
        now: Instant,
        last_read: Instant,
        last_write: Instant,
        config: &IdleConfig,
    ) -> Vec<IdleEvent> {
        let mut due = Vec::new();
        for status in IdleStatus::ALL {
            let Some(threshold) = config.get(status) else {
                continue;
            };
            let last_io = match status {
                IdleStatus::ReaderIdle => last_read,
                IdleStatus::WriterIdle => last_write,
                IdleStatus::BothIdle => last_read.max(last_write),
            };
            let slot = status.index();
            let since = match self.last_notified[slot] {
                Some(notified) if notified > last_io => notified,
                _ => {
                    // I/O since the last notification: a new window.
                    self.counts[slot] = 0;
                    last_io
                }
            };
            if now >= since + threshold {
                self.last_notified[slot] = Some(now);
                self.counts[slot] += 1;
                due.push(IdleEvent {
                    status,
                    idle_count: self.counts[slot],
                });
            }
        }
        due
    }

    /// Number of consecutive notifications sent for `status`.
    pub fn idle_count(&self, status: IdleStatus) -> u64 {
        self.counts[status.index()]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
