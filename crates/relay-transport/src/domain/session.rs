//! Sessions: physical connections and the bridge sessions layered on them.
//!
//! # Two kinds, one API (for beginners)
//!
//! A **physical** session owns a real socket (TCP stream, UDP peer, pipe).
//! Its bytes are read by a driver task and written by a writer task, both
//! running on the session's worker.
//!
//! A **bridge** session has no socket.  It rides on a parent session: writes
//! are handed to the parent, closing asks the parent to close, and received
//! bytes arrive when the parent's handler forwards them.  An upper protocol
//! layer uses the exact same [`Session`] API either way, so it never needs
//! to know how deep the stack below it is.
//!
//! ```text
//!   user handler ── Session (bridge, "alpha") ─┐ child
//!                                              │
//!   bridge handler ── Session (physical, tcp) ─┘ parent ── socket
//! ```
//!
//! # Affinity
//!
//! A session and everything layered on it belong to one worker.  Operations
//! that change a session ([`write`](Session::write),
//! [`close`](Session::close), [`set_idle_time`](Session::set_idle_time),
//! interceptors and attributes) take the caller's [`WorkerContext`] and fail
//! with [`SessionError::AffinityViolation`] when it names another worker.
//! Read-only accessors are free to call from anywhere.
//!
//! # Handler isolation
//!
//! Every handler callback runs inside `catch_unwind`.  A panic becomes a
//! [`SessionError::HandlerPanic`] delivered to that session's stack through
//! `exception_caught`; the worker keeps serving its other sessions.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use relay_core::address::ResourceAddress;
use relay_core::affinity::WorkerId;
use relay_core::idle::{IdleConfig, IdleEvent, IdleStatus, IdleWindow};

use super::error::SessionError;
use super::handler::{IoHandler, IoInterceptor, SessionInitializer};
use crate::runtime::future::{promise, CloseFuture, OpFuture, Promise, WriteFuture};
use crate::runtime::pool::WorkerLease;
use crate::runtime::worker::{WorkerContext, WorkerHandle};

/// Unique identity of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle of a session.
///
/// `Created → Open → Closing → Closed`; `Closing` is skipped when the peer
/// closes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn accepts_writes(self) -> bool {
        matches!(self, Self::Created | Self::Open)
    }
}

/// A write travelling to a physical session's writer task.
pub(crate) struct OutboundWrite {
    /// Bytes as they will hit the wire.
    pub data: Bytes,
    /// The session `write` was called on.
    pub origin: Session,
    /// Bytes as the origin wrote them, before lower-layer interceptors.
    pub origin_data: Bytes,
    pub promise: Promise<Result<(), SessionError>>,
}

pub(crate) enum OutboundCommand {
    Write(OutboundWrite),
    /// Flush what is queued, then shut the connection down.
    Close,
}

enum SessionKind {
    Physical {
        outbound: mpsc::UnboundedSender<OutboundCommand>,
    },
    Bridge {
        parent: Session,
    },
}

struct IdleState {
    own: IdleConfig,
    effective: IdleConfig,
    window: IdleWindow,
}

struct IoTimes {
    last_read: Instant,
    last_write: Instant,
}

struct SessionInner {
    id: SessionId,
    worker: WorkerHandle,
    local: ResourceAddress,
    remote: ResourceAddress,
    kind: SessionKind,
    handler: Arc<dyn IoHandler>,
    state: Mutex<SessionState>,
    idle: Mutex<IdleState>,
    child: Mutex<Option<Session>>,
    interceptors: Mutex<Vec<Arc<dyn IoInterceptor>>>,
    attributes: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    io_times: Mutex<IoTimes>,
    close_waiters: Mutex<Vec<Promise<Result<(), SessionError>>>>,
    lease: Mutex<Option<WorkerLease>>,
    created_at: Instant,
}

/// Handle to a physical or bridge session.  Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    // ── Construction (crate-internal) ─────────────────────────────────────────

    /// A session owning a real connection, placed on `lease`'s worker.
    pub(crate) fn physical(
        lease: WorkerLease,
        local: ResourceAddress,
        remote: ResourceAddress,
        handler: Arc<dyn IoHandler>,
        outbound: mpsc::UnboundedSender<OutboundCommand>,
        idle: IdleConfig,
    ) -> Self {
        let worker = lease.worker().clone();
        Self::build(
            worker,
            local,
            remote,
            SessionKind::Physical { outbound },
            handler,
            idle,
            Some(lease),
        )
    }

    /// A virtual session riding on `parent`, on the parent's worker.
    pub(crate) fn bridge(
        parent: &Session,
        local: ResourceAddress,
        remote: ResourceAddress,
        handler: Arc<dyn IoHandler>,
        idle: IdleConfig,
    ) -> Self {
        Self::build(
            parent.inner.worker.clone(),
            local,
            remote,
            SessionKind::Bridge {
                parent: parent.clone(),
            },
            handler,
            idle,
            None,
        )
    }

    fn build(
        worker: WorkerHandle,
        local: ResourceAddress,
        remote: ResourceAddress,
        kind: SessionKind,
        handler: Arc<dyn IoHandler>,
        idle: IdleConfig,
        lease: Option<WorkerLease>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::new(),
                worker,
                local,
                remote,
                kind,
                handler,
                state: Mutex::new(SessionState::Created),
                idle: Mutex::new(IdleState {
                    own: idle,
                    effective: idle,
                    window: IdleWindow::new(),
                }),
                child: Mutex::new(None),
                interceptors: Mutex::new(Vec::new()),
                attributes: Mutex::new(HashMap::new()),
                read_bytes: AtomicU64::new(0),
                written_bytes: AtomicU64::new(0),
                io_times: Mutex::new(IoTimes {
                    last_read: now,
                    last_write: now,
                }),
                close_waiters: Mutex::new(Vec::new()),
                lease: Mutex::new(lease),
                created_at: now,
            }),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The worker this session (and its whole stack) runs on.
    pub fn worker(&self) -> WorkerId {
        self.inner.worker.id()
    }

    pub fn worker_handle(&self) -> &WorkerHandle {
        &self.inner.worker
    }

    pub fn local_address(&self) -> &ResourceAddress {
        &self.inner.local
    }

    pub fn remote_address(&self) -> &ResourceAddress {
        &self.inner.remote
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.inner.kind, SessionKind::Bridge { .. })
    }

    /// The session this one rides on, if it is a bridge.
    pub fn parent(&self) -> Option<&Session> {
        match &self.inner.kind {
            SessionKind::Bridge { parent } => Some(parent),
            SessionKind::Physical { .. } => None,
        }
    }

    /// The bridge session currently layered on this one.
    pub fn child(&self) -> Option<Session> {
        self.inner.child.lock().clone()
    }

    /// The physical session at the bottom of this stack.
    pub fn root(&self) -> Session {
        let mut current = self.clone();
        while let Some(parent) = current.parent().cloned() {
            current = parent;
        }
        current
    }

    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        &self.inner.handler
    }

    pub fn read_bytes(&self) -> u64 {
        self.inner.read_bytes.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.inner.written_bytes.load(Ordering::Relaxed)
    }

    pub fn last_read(&self) -> Instant {
        self.inner.io_times.lock().last_read
    }

    pub fn last_write(&self) -> Instant {
        self.inner.io_times.lock().last_write
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Idle thresholds set on this session.
    pub fn idle_config(&self) -> IdleConfig {
        self.inner.idle.lock().own
    }

    /// This session's thresholds merged (minimum) with every layer above it.
    pub fn effective_idle_config(&self) -> IdleConfig {
        self.inner.idle.lock().effective
    }

    /// Looks up the attribute of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.inner.attributes.lock().get(&TypeId::of::<T>()).cloned()?;
        value.downcast::<T>().ok()
    }

    // ── Worker-only operations ────────────────────────────────────────────────

    /// Queues `data` for writing.
    ///
    /// On a bridge session the write is handed to the parent and the returned
    /// future completes when the parent's write does.  `message_sent` fires on
    /// this session afterwards.
    pub fn write(&self, cx: &WorkerContext, data: impl Into<Bytes>) -> WriteFuture {
        if let Err(e) = self.check_affinity(cx, "write") {
            return OpFuture::ready(Err(e));
        }
        let data = data.into();
        self.enqueue(data.clone(), self.clone(), data)
    }

    /// Requests the session to close.
    ///
    /// Writes queued before the close are flushed first.  The future
    /// completes once `session_closed` has been delivered.  Closing a closed
    /// session succeeds immediately.
    pub fn close(&self, cx: &WorkerContext) -> CloseFuture {
        if let Err(e) = self.check_affinity(cx, "close") {
            return OpFuture::ready(Err(e));
        }
        let id = self.id();
        let (waiter, fut) = promise(move || SessionError::Cancelled(id));
        let first_request = {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Closed => return OpFuture::ready(Ok(())),
                SessionState::Closing => false,
                SessionState::Created | SessionState::Open => {
                    *state = SessionState::Closing;
                    true
                }
            }
        };
        self.inner.close_waiters.lock().push(waiter);
        if first_request {
            debug!(session = %id, "close requested");
            match &self.inner.kind {
                SessionKind::Physical { outbound } => {
                    let _ = outbound.send(OutboundCommand::Close);
                }
                SessionKind::Bridge { parent } => {
                    // Completion is observed through our own close waiter.
                    let _ = parent.close(cx);
                }
            }
        }
        fut
    }

    /// Sets (or clears, with `None`) one idle threshold.
    ///
    /// The change propagates to every parent, which measure I/O on behalf of
    /// the sessions above them.
    ///
    /// # Errors
    ///
    /// [`SessionError::AffinityViolation`] when called from another worker.
    pub fn set_idle_time(
        &self,
        cx: &WorkerContext,
        status: IdleStatus,
        threshold: Option<Duration>,
    ) -> Result<(), SessionError> {
        self.check_affinity(cx, "set_idle_time")?;
        self.inner.idle.lock().own.set(status, threshold);
        self.refresh_effective_idle();
        Ok(())
    }

    /// Appends an interceptor to this session's chain.
    ///
    /// # Errors
    ///
    /// [`SessionError::AffinityViolation`] when called from another worker.
    pub fn add_interceptor(
        &self,
        cx: &WorkerContext,
        interceptor: Arc<dyn IoInterceptor>,
    ) -> Result<(), SessionError> {
        self.check_affinity(cx, "add_interceptor")?;
        self.inner.interceptors.lock().push(interceptor);
        Ok(())
    }

    /// Stores `value` as the attribute of type `T`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// [`SessionError::AffinityViolation`] when called from another worker.
    pub fn insert_attribute<T: Any + Send + Sync>(
        &self,
        cx: &WorkerContext,
        value: T,
    ) -> Result<(), SessionError> {
        self.check_affinity(cx, "insert_attribute")?;
        self.inner
            .attributes
            .lock()
            .insert(TypeId::of::<T>(), Arc::new(value));
        Ok(())
    }

    /// Removes and returns the attribute of type `T`.
    ///
    /// # Errors
    ///
    /// [`SessionError::AffinityViolation`] when called from another worker.
    pub fn remove_attribute<T: Any + Send + Sync>(
        &self,
        cx: &WorkerContext,
    ) -> Result<Option<Arc<T>>, SessionError> {
        self.check_affinity(cx, "remove_attribute")?;
        let removed = self.inner.attributes.lock().remove(&TypeId::of::<T>());
        Ok(removed.and_then(|v| v.downcast::<T>().ok()))
    }

    // ── Event delivery (crate-internal, always on the owning worker) ──────────

    pub(crate) fn initialize(&self, cx: &WorkerContext, initializer: &Arc<dyn SessionInitializer>) {
        let initializer = Arc::clone(initializer);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| initializer.initialize(cx, self))) {
            let message = panic_message(panic.as_ref());
            warn!(session = %self.id(), panic = %message, "session initializer panicked");
            self.raise(
                cx,
                SessionError::HandlerPanic {
                    callback: "initialize",
                    message,
                },
            );
        }
    }

    pub(crate) fn fire_created(&self, cx: &WorkerContext) {
        self.dispatch_event(cx, "session_created", |h| h.session_created(cx, self));
    }

    pub(crate) fn fire_opened(&self, cx: &WorkerContext) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Created => *state = SessionState::Open,
                SessionState::Closed => return,
                SessionState::Open | SessionState::Closing => {}
            }
        }
        debug!(session = %self.id(), worker = %self.worker(), local = %self.inner.local, "session opened");
        self.dispatch_event(cx, "session_opened", |h| h.session_opened(cx, self));
    }

    pub(crate) fn deliver_received(&self, cx: &WorkerContext, data: Bytes) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.inner
            .read_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.inner.io_times.lock().last_read = Instant::now();

        let chain: Vec<_> = self.inner.interceptors.lock().clone();
        let data = chain
            .iter()
            .fold(data, |data, interceptor| interceptor.on_receive(self, data));
        self.dispatch_event(cx, "message_received", move |h| {
            h.message_received(cx, self, data)
        });
    }

    pub(crate) fn fire_message_sent(&self, cx: &WorkerContext, data: &Bytes) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.dispatch_event(cx, "message_sent", |h| h.message_sent(cx, self, data));
    }

    pub(crate) fn fire_idle(&self, cx: &WorkerContext, event: IdleEvent) {
        if !self.is_open() {
            return;
        }
        self.dispatch_event(cx, "session_idle", |h| h.session_idle(cx, self, event));
    }

    /// Reports `error` to every session in this stack, bottom to top.
    pub(crate) fn raise(&self, cx: &WorkerContext, error: SessionError) {
        let mut current = Some(self.root());
        while let Some(session) = current {
            let handler = Arc::clone(&session.inner.handler);
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                handler.exception_caught(cx, &session, &error)
            }));
            if let Err(panic) = delivered {
                error!(
                    session = %session.id(),
                    panic = %panic_message(panic.as_ref()),
                    "exception handler panicked"
                );
            }
            current = session.child();
        }
    }

    /// Delivers `session_closed`, top of the stack first, exactly once.
    pub(crate) fn fire_closed(&self, cx: &WorkerContext) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        let child = self.inner.child.lock().take();
        if let Some(child) = child {
            child.fire_closed(cx);
        }
        if let Some(parent) = self.parent() {
            let mut slot = parent.inner.child.lock();
            if slot.as_ref().map(Session::id) == Some(self.id()) {
                *slot = None;
            }
        }

        debug!(
            session = %self.id(),
            read = self.read_bytes(),
            written = self.written_bytes(),
            "session closed"
        );
        self.dispatch_event(cx, "session_closed", |h| h.session_closed(cx, self));

        let waiters: Vec<_> = self.inner.close_waiters.lock().drain(..).collect();
        for waiter in waiters {
            waiter.complete(Ok(()));
        }
        drop(self.inner.lease.lock().take());
    }

    // ── Layering (crate-internal) ─────────────────────────────────────────────

    pub(crate) fn attach_child(&self, child: &Session) {
        *self.inner.child.lock() = Some(child.clone());
        self.refresh_effective_idle();
    }

    /// Recomputes the merged idle thresholds here and in every parent.
    pub(crate) fn refresh_effective_idle(&self) {
        let mut current = Some(self.clone());
        while let Some(session) = current {
            let child_effective = session.child().map(|c| c.effective_idle_config());
            {
                let mut idle = session.inner.idle.lock();
                idle.effective = match child_effective {
                    Some(above) => idle.own.merge_min(above),
                    None => idle.own,
                };
            }
            current = session.parent().cloned();
        }
    }

    /// Idle notifications due at `now` for every open session in this stack.
    pub(crate) fn collect_idle(&self, now: Instant) -> Vec<(Session, IdleEvent)> {
        let mut due = Vec::new();
        if !self.effective_idle_config().is_enabled() {
            return due;
        }
        let mut current = Some(self.clone());
        while let Some(session) = current {
            if session.is_open() {
                let (last_read, last_write) = {
                    let times = session.inner.io_times.lock();
                    (times.last_read, times.last_write)
                };
                let events = {
                    let mut idle = session.inner.idle.lock();
                    let own = idle.own;
                    idle.window.poll(now, last_read, last_write, &own)
                };
                due.extend(events.into_iter().map(|e| (session.clone(), e)));
            }
            current = session.child();
        }
        due
    }

    /// Asks the writer of a physical session to flush and stop, whatever the
    /// session state.
    pub(crate) fn shutdown_writer(&self) {
        if let SessionKind::Physical { outbound } = &self.inner.kind {
            let _ = outbound.send(OutboundCommand::Close);
        }
    }

    /// Accounts a completed write on this session and every parent.
    pub(crate) fn record_write(&self, len: usize, at: Instant) {
        let mut current = Some(self.clone());
        while let Some(session) = current {
            session
                .inner
                .written_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            session.inner.io_times.lock().last_write = at;
            current = session.parent().cloned();
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn enqueue(&self, data: Bytes, origin: Session, origin_data: Bytes) -> WriteFuture {
        let id = self.id();
        if !self.state().accepts_writes() {
            return OpFuture::ready(Err(SessionError::Closed(id)));
        }
        let chain: Vec<_> = self.inner.interceptors.lock().clone();
        let data = chain
            .iter()
            .fold(data, |data, interceptor| interceptor.on_write(self, data));

        match &self.inner.kind {
            SessionKind::Bridge { parent } => parent.enqueue(data, origin, origin_data),
            SessionKind::Physical { outbound } => {
                let (promise, fut) = promise(move || SessionError::Cancelled(id));
                let command = OutboundCommand::Write(OutboundWrite {
                    data,
                    origin,
                    origin_data,
                    promise,
                });
                match outbound.send(command) {
                    Ok(()) => fut,
                    Err(_) => OpFuture::ready(Err(SessionError::Closed(id))),
                }
            }
        }
    }

    fn check_affinity(&self, cx: &WorkerContext, operation: &'static str) -> Result<(), SessionError> {
        let owner = self.worker();
        let caller = cx.worker();
        if owner == caller {
            return Ok(());
        }
        error!(
            session = %self.id(),
            owner = %owner,
            caller = %caller,
            operation,
            "affinity violation: session used from a foreign worker"
        );
        Err(SessionError::AffinityViolation {
            session: self.id(),
            owner,
            caller,
            operation,
        })
    }

    fn dispatch_event<F>(&self, cx: &WorkerContext, callback: &'static str, deliver: F)
    where
        F: FnOnce(&dyn IoHandler),
    {
        let handler = Arc::clone(&self.inner.handler);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| deliver(handler.as_ref()))) {
            let message = panic_message(panic.as_ref());
            warn!(session = %self.id(), callback, panic = %message, "handler panicked");
            self.raise(cx, SessionError::HandlerPanic { callback, message });
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("worker", &self.worker())
            .field("local", &self.inner.local.uri())
            .field("remote", &self.inner.remote.uri())
            .field("bridge", &self.is_bridge())
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pool::AffinityPool;
    use std::sync::mpsc as std_mpsc;

    /// Records every callback as a short string.
    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
        panic_on_receive: bool,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl IoHandler for RecordingHandler {
        fn session_created(&self, _cx: &WorkerContext, _s: &Session) {
            self.events.lock().push("created".into());
        }
        fn session_opened(&self, _cx: &WorkerContext, _s: &Session) {
            self.events.lock().push("opened".into());
        }
        fn message_received(&self, _cx: &WorkerContext, _s: &Session, data: Bytes) {
            if self.panic_on_receive {
                panic!("boom");
            }
            self.events
                .lock()
                .push(format!("received:{}", String::from_utf8_lossy(&data)));
        }
        fn exception_caught(&self, _cx: &WorkerContext, _s: &Session, error: &SessionError) {
            self.events.lock().push(format!("exception:{error}"));
        }
        fn session_closed(&self, _cx: &WorkerContext, _s: &Session) {
            self.events.lock().push("closed".into());
        }
    }

    fn addr(scheme: &str) -> ResourceAddress {
        ResourceAddress::new(scheme, "127.0.0.1", Some(1), "")
    }

    /// Runs `f` on the worker owning `lease` and returns its result.
    fn on_worker<T: Send + 'static>(
        worker: &WorkerHandle,
        f: impl FnOnce(&WorkerContext) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = std_mpsc::channel();
        worker
            .execute(move |cx| {
                tx.send(f(cx)).unwrap();
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_events_are_delivered_in_order() {
        // Arrange
        let pool = AffinityPool::new(1).unwrap();
        let lease = pool.next_worker(None);
        let worker = lease.worker().clone();
        let handler = Arc::new(RecordingHandler::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::physical(
            lease,
            addr("tcp"),
            addr("tcp"),
            handler.clone(),
            tx,
            IdleConfig::default(),
        );

        // Act
        let s = session.clone();
        on_worker(&worker, move |cx| {
            s.fire_created(cx);
            s.fire_opened(cx);
            s.deliver_received(cx, Bytes::from_static(b"hi"));
            s.fire_closed(cx);
            s.fire_closed(cx);
        });

        // Assert
        assert_eq!(
            handler.events(),
            vec!["created", "opened", "received:hi", "closed"]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.read_bytes(), 2);
        assert_eq!(pool.total_load(), 0, "lease released on close");
        pool.shutdown();
    }

    #[test]
    fn test_write_from_foreign_worker_is_affinity_violation() {
        // Arrange
        let pool = AffinityPool::new(2).unwrap();
        let owner_lease = pool.next_worker(Some(WorkerId::new(0)));
        let foreign = pool.worker(WorkerId::new(1)).unwrap().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::physical(
            owner_lease,
            addr("tcp"),
            addr("tcp"),
            Arc::new(RecordingHandler::default()),
            tx,
            IdleConfig::default(),
        );

        // Act
        let s = session.clone();
        let result = on_worker(&foreign, move |cx| {
            let mut fut = s.write(cx, Bytes::from_static(b"x"));
            assert!(fut.is_ready());
            s.set_idle_time(cx, IdleStatus::ReaderIdle, Some(Duration::from_secs(1)))
        });

        // Assert
        assert!(matches!(
            result,
            Err(SessionError::AffinityViolation { operation: "set_idle_time", .. })
        ));
        assert!(rx.try_recv().is_err(), "nothing reached the writer");
        pool.shutdown();
    }

    #[test]
    fn test_write_on_bridge_reaches_parent_writer() {
        // Arrange
        let pool = AffinityPool::new(1).unwrap();
        let lease = pool.next_worker(None);
        let worker = lease.worker().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let parent = Session::physical(
            lease,
            addr("tcp"),
            addr("tcp"),
            Arc::new(RecordingHandler::default()),
            tx,
            IdleConfig::default(),
        );
        let child = Session::bridge(
            &parent,
            addr("alpha"),
            addr("alpha"),
            Arc::new(RecordingHandler::default()),
            IdleConfig::default(),
        );

        // Act
        let c = child.clone();
        on_worker(&worker, move |cx| {
            let _ = c.write(cx, Bytes::from_static(b"payload"));
        });

        // Assert
        match rx.try_recv() {
            Ok(OutboundCommand::Write(write)) => {
                assert_eq!(&write.data[..], b"payload");
                assert_eq!(write.origin, child);
            }
            _ => panic!("expected a queued write"),
        }
        assert_eq!(child.worker(), parent.worker());
        assert_eq!(child.root(), parent);
        pool.shutdown();
    }

    #[test]
    fn test_handler_panic_becomes_exception() {
        let pool = AffinityPool::new(1).unwrap();
        let lease = pool.next_worker(None);
        let worker = lease.worker().clone();
        let handler = Arc::new(RecordingHandler {
            panic_on_receive: true,
            ..RecordingHandler::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::physical(
            lease,
            addr("tcp"),
            addr("tcp"),
            handler.clone(),
            tx,
            IdleConfig::default(),
        );

        let s = session.clone();
        on_worker(&worker, move |cx| {
            s.fire_opened(cx);
            s.deliver_received(cx, Bytes::from_static(b"x"));
        });

        let events = handler.events();
        assert_eq!(events[0], "opened");
        assert!(events[1].starts_with("exception:handler panicked in message_received"));
        assert!(session.is_open(), "a handler panic does not close the session");
        pool.shutdown();
    }

    #[test]
    fn test_closing_parent_closes_child_first() {
        // Arrange
        let pool = AffinityPool::new(1).unwrap();
        let lease = pool.next_worker(None);
        let worker = lease.worker().clone();
        let parent_handler = Arc::new(RecordingHandler::default());
        let child_handler = Arc::new(RecordingHandler::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let parent = Session::physical(
            lease,
            addr("tcp"),
            addr("tcp"),
            parent_handler.clone(),
            tx,
            IdleConfig::default(),
        );
        let child = Session::bridge(
            &parent,
            addr("alpha"),
            addr("alpha"),
            child_handler.clone(),
            IdleConfig::default(),
        );

        // Act
        let (p, c) = (parent.clone(), child.clone());
        on_worker(&worker, move |cx| {
            p.attach_child(&c);
            p.fire_opened(cx);
            c.fire_opened(cx);
            p.fire_closed(cx);
        });

        // Assert
        assert_eq!(child.state(), SessionState::Closed);
        assert_eq!(child_handler.events().last().unwrap(), "closed");
        assert!(parent.child().is_none());
        pool.shutdown();
    }

    #[test]
    fn test_child_idle_threshold_propagates_to_parent_as_minimum() {
        let pool = AffinityPool::new(1).unwrap();
        let lease = pool.next_worker(None);
        let worker = lease.worker().clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        let parent_idle = IdleConfig {
            read: Some(Duration::from_secs(10)),
            ..IdleConfig::default()
        };
        let parent = Session::physical(
            lease,
            addr("tcp"),
            addr("tcp"),
            Arc::new(RecordingHandler::default()),
            tx,
            parent_idle,
        );
        let child = Session::bridge(
            &parent,
            addr("alpha"),
            addr("alpha"),
            Arc::new(RecordingHandler::default()),
            IdleConfig::default(),
        );

        let (p, c) = (parent.clone(), child.clone());
        on_worker(&worker, move |cx| {
            p.attach_child(&c);
            c.set_idle_time(cx, IdleStatus::ReaderIdle, Some(Duration::from_secs(2)))
                .unwrap();
            c.set_idle_time(cx, IdleStatus::WriterIdle, Some(Duration::from_secs(3)))
                .unwrap();
        });

        let effective = parent.effective_idle_config();
        assert_eq!(effective.read, Some(Duration::from_secs(2)));
        assert_eq!(effective.write, Some(Duration::from_secs(3)));
        assert_eq!(parent.idle_config().read, Some(Duration::from_secs(10)));
        pool.shutdown();
    }

    #[test]
    fn test_attributes_round_trip_by_type() {
        let pool = AffinityPool::new(1).unwrap();
        let lease = pool.next_worker(None);
        let worker = lease.worker().clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::physical(
            lease,
            addr("tcp"),
            addr("tcp"),
            Arc::new(RecordingHandler::default()),
            tx,
            IdleConfig::default(),
        );

        #[derive(Debug, PartialEq)]
        struct Tag(&'static str);

        let s = session.clone();
        on_worker(&worker, move |cx| s.insert_attribute(cx, Tag("backend")).unwrap());

        assert_eq!(session.attribute::<Tag>().as_deref(), Some(&Tag("backend")));
        assert!(session.attribute::<u32>().is_none());
        pool.shutdown();
    }
}
