//! Errors raised on an individual session.
//!
//! Session errors are delivered to the affected session's handler through
//! `exception_caught`, or returned from that session's write and close
//! handles.  They are `Clone` so one failure can be reported to every layer
//! of a bridged stack.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use relay_core::affinity::WorkerId;

use super::session::SessionId;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// A mutating operation was attempted from the wrong worker.
    ///
    /// This is always a bug in the calling layer.
    #[error("{operation} on session {session} (owned by {owner}) attempted from {caller}")]
    AffinityViolation {
        session: SessionId,
        owner: WorkerId,
        caller: WorkerId,
        operation: &'static str,
    },

    #[error("session {0} is closed")]
    Closed(SessionId),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A handler callback panicked; the panic was contained.
    #[error("handler panicked in {callback}: {message}")]
    HandlerPanic {
        callback: &'static str,
        message: String,
    },

    /// The write or close was abandoned before it completed.
    #[error("operation on session {0} was cancelled")]
    Cancelled(SessionId),
}

impl SessionError {
    pub fn io(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        Self::io(error)
    }
}
