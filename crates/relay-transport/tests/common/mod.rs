//! Helpers shared by the relay-transport integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use relay_transport::{
    IdleEvent, IoHandler, Session, SessionError, SessionId, TransportConfig, TransportService,
    WorkerContext, WorkerId,
};

/// Starts a service with `workers` workers and a fast idle tick.
pub fn service(workers: usize) -> TransportService {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    TransportService::new(TransportConfig {
        worker_count: workers,
        idle_tick: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(1),
        ..TransportConfig::default()
    })
    .expect("transport service starts")
}

/// Polls `condition` every 10 ms, failing the test after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Created,
    Opened,
    Received(Bytes),
    Sent,
    Idle(IdleEvent),
    Exception(String),
    Closed,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub session: SessionId,
    pub session_worker: WorkerId,
    pub callback_worker: WorkerId,
    pub thread: ThreadId,
    pub at: Instant,
    pub event: Event,
}

/// Handler that remembers every callback it receives.
#[derive(Default)]
pub struct Recorder {
    records: Mutex<Vec<Record>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, cx: &WorkerContext, session: &Session, event: Event) {
        self.records.lock().push(Record {
            session: session.id(),
            session_worker: session.worker(),
            callback_worker: cx.worker(),
            thread: thread::current().id(),
            at: Instant::now(),
            event,
        });
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.records.lock().iter().filter(|r| matches(&r.event)).count()
    }

    pub fn opened(&self) -> usize {
        self.count(|e| *e == Event::Opened)
    }

    pub fn closed(&self) -> usize {
        self.count(|e| *e == Event::Closed)
    }

    /// Distinct sessions seen, in order of first appearance.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut seen = HashSet::new();
        self.records
            .lock()
            .iter()
            .filter(|r| seen.insert(r.session))
            .map(|r| r.session)
            .collect()
    }

    pub fn events_of(&self, session: SessionId) -> Vec<Event> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.session == session)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Every byte received, concatenated per session.
    pub fn received(&self) -> HashMap<SessionId, Bytes> {
        let mut out: HashMap<SessionId, BytesMut> = HashMap::new();
        for record in self.records.lock().iter() {
            if let Event::Received(data) = &record.event {
                out.entry(record.session).or_default().extend_from_slice(data);
            }
        }
        out.into_iter().map(|(k, v)| (k, v.freeze())).collect()
    }

    pub fn idle_records(&self) -> Vec<Record> {
        self.records
            .lock()
            .iter()
            .filter(|r| matches!(r.event, Event::Idle(_)))
            .cloned()
            .collect()
    }
}

impl IoHandler for Recorder {
    fn session_created(&self, cx: &WorkerContext, session: &Session) {
        self.push(cx, session, Event::Created);
    }

    fn session_opened(&self, cx: &WorkerContext, session: &Session) {
        self.push(cx, session, Event::Opened);
    }

    fn message_received(&self, cx: &WorkerContext, session: &Session, data: Bytes) {
        self.push(cx, session, Event::Received(data));
    }

    fn message_sent(&self, cx: &WorkerContext, session: &Session, _data: &Bytes) {
        self.push(cx, session, Event::Sent);
    }

    fn session_idle(&self, cx: &WorkerContext, session: &Session, event: IdleEvent) {
        self.push(cx, session, Event::Idle(event));
    }

    fn exception_caught(&self, cx: &WorkerContext, session: &Session, error: &SessionError) {
        self.push(cx, session, Event::Exception(error.to_string()));
    }

    fn session_closed(&self, cx: &WorkerContext, session: &Session) {
        self.push(cx, session, Event::Closed);
    }
}
