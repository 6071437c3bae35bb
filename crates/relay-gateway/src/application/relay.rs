//! Relay service: each accepted session dials a backend and the two are
//! spliced together.
//!
//! # How a relay pair works (for beginners)
//!
//! ```text
//!   client ──▶ frontend session ══ Link ══ backend session ──▶ backend
//!              (accepted)                  (dialled, same worker)
//! ```
//!
//! The backend is dialled with the frontend's worker as its affinity, so
//! both halves of a pair live on one thread and can write to each other
//! directly.  Bytes that arrive from the client before the backend is open
//! wait in the [`Link`].  Whichever half closes first closes the other.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use relay_transport::{
    IoHandler, ResourceAddress, Session, SessionError, TransportService, WorkerContext,
};

#[derive(Default)]
struct LinkState {
    backend: Option<Session>,
    pending: Vec<Bytes>,
    frontend_closed: bool,
}

/// Shared state of one frontend/backend pair, stored as a frontend attribute.
#[derive(Default)]
pub struct Link {
    state: Mutex<LinkState>,
}

impl Link {
    pub fn backend(&self) -> Option<Session> {
        self.state.lock().backend.clone()
    }

    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending.iter().map(Bytes::len).sum()
    }
}

/// Handler for `kind = "relay"` services.
pub struct RelayHandler {
    name: String,
    service: TransportService,
    backend: ResourceAddress,
}

impl RelayHandler {
    pub fn new(name: impl Into<String>, service: TransportService, backend: ResourceAddress) -> Self {
        Self {
            name: name.into(),
            service,
            backend,
        }
    }
}

impl IoHandler for RelayHandler {
    fn session_created(&self, cx: &WorkerContext, frontend: &Session) {
        let _ = frontend.insert_attribute(cx, Link::default());
    }

    fn session_opened(&self, cx: &WorkerContext, frontend: &Session) {
        let Some(link) = frontend.attribute::<Link>() else {
            return;
        };
        let handler = Arc::new(BackendHandler {
            frontend: frontend.clone(),
            link,
        });
        let connecting = self
            .service
            .connect_from(cx, self.backend.clone(), handler, None);

        let cx_local = cx.clone();
        let frontend = frontend.clone();
        let service = self.name.clone();
        let backend = self.backend.clone();
        cx.spawn_local(async move {
            if let Err(error) = connecting.await {
                warn!(%service, %backend, session = %frontend.id(), %error, "backend unreachable; closing client");
                let _ = frontend.close(&cx_local);
            }
        });
    }

    fn message_received(&self, cx: &WorkerContext, frontend: &Session, data: Bytes) {
        let Some(link) = frontend.attribute::<Link>() else {
            return;
        };
        let backend = {
            let mut state = link.state.lock();
            match &state.backend {
                Some(backend) => backend.clone(),
                None => {
                    state.pending.push(data);
                    return;
                }
            }
        };
        let _ = backend.write(cx, data);
    }

    fn exception_caught(&self, _cx: &WorkerContext, frontend: &Session, error: &SessionError) {
        warn!(service = %self.name, session = %frontend.id(), %error, "relay client error");
    }

    fn session_closed(&self, cx: &WorkerContext, frontend: &Session) {
        let Some(link) = frontend.attribute::<Link>() else {
            return;
        };
        let backend = {
            let mut state = link.state.lock();
            state.frontend_closed = true;
            state.pending.clear();
            state.backend.take()
        };
        if let Some(backend) = backend {
            let _ = backend.close(cx);
        }
        debug!(service = %self.name, session = %frontend.id(), "relay client closed");
    }
}

/// Handler for the dialled half of a pair.
struct BackendHandler {
    frontend: Session,
    link: Arc<Link>,
}

impl IoHandler for BackendHandler {
    fn session_opened(&self, cx: &WorkerContext, backend: &Session) {
        let pending = {
            let mut state = self.link.state.lock();
            if state.frontend_closed {
                None
            } else {
                state.backend = Some(backend.clone());
                Some(std::mem::take(&mut state.pending))
            }
        };
        match pending {
            Some(pending) => {
                debug!(
                    frontend = %self.frontend.id(),
                    backend = %backend.id(),
                    worker = %cx.worker(),
                    flushed = pending.len(),
                    "relay pair established"
                );
                for data in pending {
                    let _ = backend.write(cx, data);
                }
            }
            None => {
                let _ = backend.close(cx);
            }
        }
    }

    fn message_received(&self, cx: &WorkerContext, _backend: &Session, data: Bytes) {
        let _ = self.frontend.write(cx, data);
    }

    fn exception_caught(&self, _cx: &WorkerContext, backend: &Session, error: &SessionError) {
        warn!(backend = %backend.id(), %error, "relay backend error");
    }

    fn session_closed(&self, cx: &WorkerContext, backend: &Session) {
        self.link.state.lock().backend = None;
        debug!(backend = %backend.id(), frontend = %self.frontend.id(), "relay backend closed");
        let _ = self.frontend.close(cx);
    }
}
