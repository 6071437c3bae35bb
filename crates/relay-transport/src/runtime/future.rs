//! One-shot promise/future pairs used as operation handles.
//!
//! Every asynchronous operation the transport layer exposes (`bind`,
//! `unbind`, `connect`, `write`, `close`) returns an [`OpFuture`].  The side
//! doing the work keeps the matching [`Promise`] and completes it exactly once.
//!
//! # Chaining (for beginners)
//!
//! A write on a bridge session is really a write on its parent connection.
//! Rather than registering a listener on the parent's future that then
//! completes the child's future, the bridge simply hands the parent's
//! `OpFuture` back to the caller: the child's write completes when, and
//! only when, the parent's does.  Where two futures need to be combined the
//! usual `futures_util` combinators apply, because `OpFuture` is an ordinary
//! [`Future`].
//!
//! # Cancellation
//!
//! If the promise is dropped without being completed (for example because
//! the worker running the operation shut down), the future resolves to the
//! error produced by the `on_cancel` closure given at creation time, so
//! callers always get a typed error and never hang.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::domain::error::SessionError;
use crate::domain::session::Session;
use relay_core::error::{BindError, ConnectError, UnbindError};

/// Completes an [`OpFuture`].
pub struct Promise<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Promise<T> {
    /// Delivers `value`.  Silently ignored if the future was dropped.
    pub fn complete(self, value: T) {
        let _ = self.tx.send(value);
    }

    /// `true` once the receiving future has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("abandoned", &self.tx.is_closed())
            .finish()
    }
}

type CancelFn<E> = Box<dyn FnOnce() -> E + Send>;

enum State<T, E> {
    Pending {
        rx: oneshot::Receiver<Result<T, E>>,
        on_cancel: Option<CancelFn<E>>,
    },
    Ready(Option<Result<T, E>>),
}

/// Handle to the outcome of an asynchronous transport operation.
#[must_use = "operation handles do nothing unless awaited or polled"]
pub struct OpFuture<T, E> {
    state: State<T, E>,
}

/// Creates a connected promise/future pair.
///
/// `on_cancel` builds the error returned if the promise is dropped
/// uncompleted.
pub fn promise<T, E>(
    on_cancel: impl FnOnce() -> E + Send + 'static,
) -> (Promise<Result<T, E>>, OpFuture<T, E>) {
    let (tx, rx) = oneshot::channel();
    (
        Promise { tx },
        OpFuture {
            state: State::Pending {
                rx,
                on_cancel: Some(Box::new(on_cancel)),
            },
        },
    )
}

impl<T, E> OpFuture<T, E> {
    /// A future that is already complete.
    pub fn ready(value: Result<T, E>) -> Self {
        Self {
            state: State::Ready(Some(value)),
        }
    }

    /// `true` if the outcome is available without waiting.
    pub fn is_ready(&mut self) -> bool {
        match &mut self.state {
            State::Ready(_) => true,
            State::Pending { rx, .. } => match rx.try_recv() {
                Ok(value) => {
                    self.state = State::Ready(Some(value));
                    true
                }
                Err(oneshot::error::TryRecvError::Empty) => false,
                Err(oneshot::error::TryRecvError::Closed) => true,
            },
        }
    }
}

// The outcome is moved out by value and never pinned in place.
impl<T, E> Unpin for OpFuture<T, E> {}

impl<T, E> Future for OpFuture<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(value) => match value.take() {
                Some(v) => Poll::Ready(v),
                None => panic!("OpFuture polled after completion"),
            },
            State::Pending { rx, on_cancel } => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(value)) => {
                    this.state = State::Ready(None);
                    Poll::Ready(value)
                }
                Poll::Ready(Err(_)) => {
                    let cancel = on_cancel.take();
                    this.state = State::Ready(None);
                    match cancel {
                        Some(make_err) => Poll::Ready(Err(make_err())),
                        None => panic!("OpFuture polled after completion"),
                    }
                }
            },
        }
    }
}

impl<T, E> fmt::Debug for OpFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Pending { .. } => "pending",
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "consumed",
        };
        f.debug_struct("OpFuture").field("state", &state).finish()
    }
}

pub type BindFuture = OpFuture<(), BindError>;
pub type UnbindFuture = OpFuture<(), UnbindError>;
pub type ConnectFuture = OpFuture<Session, ConnectError>;
pub type WriteFuture = OpFuture<(), SessionError>;
pub type CloseFuture = OpFuture<(), SessionError>;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[derive(Debug, PartialEq)]
    struct Gone;

    #[test]
    fn test_future_is_pending_until_completed() {
        // Arrange
        let (promise, fut) = promise::<u32, Gone>(|| Gone);
        let mut fut = task::spawn(fut);

        // Act + Assert
        assert_pending!(fut.poll());
        promise.complete(Ok(7));
        assert!(fut.is_woken());
        assert_ready_eq!(fut.poll(), Ok(7));
    }

    #[test]
    fn test_dropped_promise_resolves_to_cancel_error() {
        let (promise, fut) = promise::<u32, Gone>(|| Gone);
        let mut fut = task::spawn(fut);
        drop(promise);
        assert_ready_eq!(fut.poll(), Err(Gone));
    }

    #[test]
    fn test_future_is_unpin_for_any_outcome_type() {
        fn assert_unpin<F: Unpin>(_: &F) {}

        // Arrange: an outcome type that is itself `!Unpin`.
        let (promise, fut) = promise::<std::marker::PhantomPinned, Gone>(|| Gone);

        // Act + Assert
        assert_unpin(&fut);
        let mut fut = task::spawn(fut);
        promise.complete(Ok(std::marker::PhantomPinned));
        assert!(matches!(fut.poll(), Poll::Ready(Ok(_))));
    }

    #[test]
    fn test_ready_future_resolves_immediately() {
        let mut fut = task::spawn(OpFuture::<u32, Gone>::ready(Ok(1)));
        assert_ready_eq!(fut.poll(), Ok(1));
    }

    #[test]
    fn test_is_ready_observes_completion_without_polling() {
        let (promise, mut fut) = promise::<(), Gone>(|| Gone);
        assert!(!fut.is_ready());
        assert!(!promise.is_abandoned());
        promise.complete(Ok(()));
        assert!(fut.is_ready());
    }

    #[test]
    fn test_dropping_future_abandons_promise() {
        let (promise, fut) = promise::<(), Gone>(|| Gone);
        drop(fut);
        assert!(promise.is_abandoned());
    }
}
