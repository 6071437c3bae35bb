//! Contracts between the transport layer and the protocol layers above it.
//!
//! - [`IoHandler`] receives a session's events, in order, on the session's
//!   worker: `created → opened → (received | sent | idle | exception)* →
//!   closed`.
//! - [`SessionInitializer`] runs once, before `created`, to customise a new
//!   session (add interceptors, attributes, idle thresholds).
//! - [`IoInterceptor`] sees every chunk received by and written to a
//!   session, in the order interceptors were added.
//!
//! Handlers are synchronous.  Anything that needs to wait spawns a local
//! task through [`WorkerContext::spawn_local`], which keeps it on the same
//! worker.  Outbound connections opened from a callback should go through
//! `TransportService::connect_from(cx, ..)` for the same reason.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use relay_core::binding::BindTarget;
use relay_core::idle::IdleEvent;

use super::error::SessionError;
use super::session::Session;
use crate::runtime::worker::WorkerContext;

/// Receives the events of every session bound or connected with it.
///
/// Every method has an empty default so handlers implement only what they
/// need.
#[allow(unused_variables)]
pub trait IoHandler: Send + Sync + 'static {
    fn session_created(&self, cx: &WorkerContext, session: &Session) {}

    fn session_opened(&self, cx: &WorkerContext, session: &Session) {}

    fn message_received(&self, cx: &WorkerContext, session: &Session, data: Bytes) {}

    /// A write issued on `session` has been handed to the OS.
    fn message_sent(&self, cx: &WorkerContext, session: &Session, data: &Bytes) {}

    fn session_idle(&self, cx: &WorkerContext, session: &Session, event: IdleEvent) {}

    fn exception_caught(&self, cx: &WorkerContext, session: &Session, error: &SessionError) {}

    fn session_closed(&self, cx: &WorkerContext, session: &Session) {}
}

/// One-shot hook run on a new session before any event is delivered.
pub trait SessionInitializer: Send + Sync + 'static {
    fn initialize(&self, cx: &WorkerContext, session: &Session);
}

impl<F> SessionInitializer for F
where
    F: Fn(&WorkerContext, &Session) + Send + Sync + 'static,
{
    fn initialize(&self, cx: &WorkerContext, session: &Session) {
        self(cx, session)
    }
}

/// Observes (and may rewrite) bytes flowing through a session.
#[allow(unused_variables)]
pub trait IoInterceptor: Send + Sync + 'static {
    fn on_receive(&self, session: &Session, data: Bytes) -> Bytes {
        data
    }

    fn on_write(&self, session: &Session, data: Bytes) -> Bytes {
        data
    }
}

/// Handler plus optional initializer: what a binding points at.
#[derive(Clone)]
pub struct BoundHandler {
    handler: Arc<dyn IoHandler>,
    initializer: Option<Arc<dyn SessionInitializer>>,
}

impl BoundHandler {
    pub fn new(
        handler: Arc<dyn IoHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> Self {
        Self {
            handler,
            initializer,
        }
    }

    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        &self.handler
    }

    pub fn initializer(&self) -> Option<&Arc<dyn SessionInitializer>> {
        self.initializer.as_ref()
    }
}

impl BindTarget for BoundHandler {
    /// Same handler instance and same initializer instance.
    fn same_target(&self, other: &Self) -> bool {
        let same_init = match (&self.initializer, &other.initializer) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        Arc::ptr_eq(&self.handler, &other.handler) && same_init
    }
}

impl fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundHandler")
            .field("handler", &Arc::as_ptr(&self.handler))
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}
