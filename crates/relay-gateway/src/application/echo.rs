//! Echo service: every byte received goes straight back.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use relay_transport::{IdleEvent, IoHandler, Session, SessionError, WorkerContext};

/// Handler for `kind = "echo"` services.
#[derive(Debug, Default)]
pub struct EchoHandler {
    service: String,
}

impl EchoHandler {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl IoHandler for EchoHandler {
    fn session_opened(&self, _cx: &WorkerContext, session: &Session) {
        debug!(
            service = %self.service,
            session = %session.id(),
            remote = %session.remote_address(),
            worker = %session.worker(),
            "echo session opened"
        );
    }

    fn message_received(&self, cx: &WorkerContext, session: &Session, data: Bytes) {
        trace!(session = %session.id(), bytes = data.len(), "echoing");
        // The write completes in the background; failures surface through
        // `exception_caught`.
        let _ = session.write(cx, data);
    }

    fn session_idle(&self, cx: &WorkerContext, session: &Session, event: IdleEvent) {
        debug!(session = %session.id(), status = ?event.status, "idle echo session closed");
        let _ = session.close(cx);
    }

    fn exception_caught(&self, _cx: &WorkerContext, session: &Session, error: &SessionError) {
        warn!(service = %self.service, session = %session.id(), %error, "echo session error");
    }

    fn session_closed(&self, _cx: &WorkerContext, session: &Session) {
        debug!(
            service = %self.service,
            session = %session.id(),
            read = session.read_bytes(),
            written = session.written_bytes(),
            "echo session closed"
        );
    }
}
