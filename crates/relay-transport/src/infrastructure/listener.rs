//! Reference-counted physical listeners shared by the socket transports.
//!
//! Each physical transport keeps a [`BindingRegistry`] of handlers and one
//! [`ListenerHandle`] per listening authority.  The first bind on an
//! authority opens the listener; further binds (other next protocols, or
//! the same handler again) only add references.  The listener closes when
//! the last reference is released.
//!
//! Bind and unbind on one transport are serialised by an async lock, so a
//! listener is never opened and closed for the same authority at once.
//!
//! # Address families
//!
//! A host may resolve to both IPv4 and IPv6 addresses.  When the OS rejects
//! one family outright (no IPv6 stack, for example) [`AddressFamilies`]
//! skips that family for the rest of the transport's life instead of
//! failing every bind.
//!
//! [`BindingRegistry`]: relay_core::binding::BindingRegistry

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::lookup_host;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_core::address::ResourceAddress;
use relay_core::binding::{BindKey, Binding, NextProtocolBindings, UnbindOutcome};
use relay_core::error::{BindError, UnbindError};

use crate::domain::handler::BoundHandler;
use crate::domain::transport::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            Self::V4
        } else {
            Self::V6
        }
    }
}

#[cfg(unix)]
const EAFNOSUPPORT: i32 = libc::EAFNOSUPPORT;
#[cfg(windows)]
const EAFNOSUPPORT: i32 = 10047; // WSAEAFNOSUPPORT

/// `true` if the OS refused the socket because of its address family.
pub(crate) fn is_family_unsupported(error: &io::Error) -> bool {
    #[cfg(any(unix, windows))]
    {
        error.raw_os_error() == Some(EAFNOSUPPORT)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = error;
        false
    }
}

/// Address families one transport has found it cannot listen on.
#[derive(Debug, Default)]
pub(crate) struct AddressFamilies {
    disabled: Mutex<HashSet<Family>>,
}

impl AddressFamilies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_disabled(&self, family: Family) -> bool {
        self.disabled.lock().contains(&family)
    }

    /// Resolves the listening authority of `address`.
    ///
    /// An ephemeral port would differ per resolved address, so port 0 keeps
    /// only the first one.
    pub(crate) async fn resolve(address: &ResourceAddress) -> Result<Vec<SocketAddr>, BindError> {
        let mut resolved: Vec<SocketAddr> = lookup_host(address.bind_authority())
            .await
            .map_err(|source| BindError::UnresolvedHost {
                address: address.uri().to_string(),
                source,
            })?
            .collect();
        resolved.dedup();
        if address.port() == Some(0) {
            resolved.truncate(1);
        }
        Ok(resolved)
    }

    /// Calls `open` for every resolved address whose family is still enabled.
    ///
    /// A family the OS rejects is disabled and skipped; any other failure
    /// fails the whole bind.  Fails with `UnsupportedFamily` when nothing
    /// could be opened.
    pub(crate) fn open_each<L>(
        &self,
        uri: &str,
        resolved: Vec<SocketAddr>,
        mut open: impl FnMut(SocketAddr) -> io::Result<L>,
    ) -> Result<Vec<L>, BindError> {
        let mut opened = Vec::new();
        for addr in resolved {
            let family = Family::of(&addr);
            if self.is_disabled(family) {
                continue;
            }
            match open(addr) {
                Ok(listener) => opened.push(listener),
                Err(e) if is_family_unsupported(&e) => {
                    warn!(%addr, error = %e, "address family unsupported; skipping it from now on");
                    self.disabled.lock().insert(family);
                }
                Err(e) => return Err(BindError::from_listen(uri, e)),
            }
        }
        if opened.is_empty() {
            return Err(BindError::UnsupportedFamily {
                address: uri.to_string(),
            });
        }
        Ok(opened)
    }
}

/// An open physical listener and the tasks serving it.
pub(crate) struct ListenerHandle {
    local_addrs: Vec<SocketAddr>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    pub(crate) fn new(
        local_addrs: Vec<SocketAddr>,
        stop: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            local_addrs,
            stop,
            tasks,
        }
    }

    /// A listener with no socket or task (in-process pipes).
    pub(crate) fn detached() -> Self {
        let (stop, _) = watch::channel(false);
        Self::new(Vec::new(), stop, Vec::new())
    }

    /// Stops the serving tasks and waits until they have released the socket.
    async fn close(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Binding table plus listener table of one physical transport.
pub(crate) struct PhysicalBindings {
    scheme: &'static str,
    registry: Arc<HandlerRegistry>,
    listeners: Mutex<HashMap<BindKey, ListenerHandle>>,
    lock: tokio::sync::Mutex<()>,
}

impl PhysicalBindings {
    pub(crate) fn new(scheme: &'static str) -> Self {
        Self {
            scheme,
            registry: Arc::new(HandlerRegistry::new()),
            listeners: Mutex::new(HashMap::new()),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Registers `target`, calling `open` when the authority is new.
    ///
    /// A failed `open` leaves the registry as it was.
    pub(crate) async fn bind<F, Fut>(
        &self,
        address: &ResourceAddress,
        target: BoundHandler,
        open: F,
    ) -> Result<(), BindError>
    where
        F: FnOnce(BindKey) -> Fut,
        Fut: Future<Output = Result<ListenerHandle, BindError>>,
    {
        let _guard = self.lock.lock().await;
        let outcome = self.registry.bind(address, target)?;
        if outcome.first_on_key {
            match open(outcome.key.clone()).await {
                Ok(listener) => {
                    info!(
                        scheme = self.scheme,
                        key = %outcome.key,
                        local = ?listener.local_addrs,
                        "listener opened"
                    );
                    self.listeners.lock().insert(outcome.key.clone(), listener);
                }
                Err(e) => {
                    self.registry.remove(address);
                    return Err(e);
                }
            }
        }
        info!(%address, refs = outcome.ref_count, "bound");
        Ok(())
    }

    /// Releases one reference; closes the listener with the last one.
    pub(crate) async fn unbind(&self, address: &ResourceAddress) -> Result<(), UnbindError> {
        let _guard = self.lock.lock().await;
        match self.registry.unbind(address) {
            UnbindOutcome::NotBound => {
                debug!(%address, "unbind of an unbound address ignored");
            }
            UnbindOutcome::Released {
                key,
                remaining_refs,
                last_on_key,
            } => {
                info!(%address, remaining_refs, "unbound");
                if last_on_key {
                    let listener = self.listeners.lock().remove(&key);
                    if let Some(listener) = listener {
                        listener.close().await;
                        info!(scheme = self.scheme, %key, "listener closed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Forgets every binding and closes every listener.
    pub(crate) async fn dispose(&self) {
        let _guard = self.lock.lock().await;
        self.registry.clear();
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        for (key, listener) in listeners {
            listener.close().await;
            info!(scheme = self.scheme, %key, "listener closed");
        }
    }

    pub(crate) fn lookup(&self, address: &ResourceAddress) -> Option<Binding<BoundHandler>> {
        self.registry.lookup(address)
    }

    pub(crate) fn bindings_at(
        &self,
        address: &ResourceAddress,
    ) -> Option<NextProtocolBindings<BoundHandler>> {
        self.registry.bindings_at(&BindKey::of(address))
    }

    pub(crate) fn local_addrs(&self, address: &ResourceAddress) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .get(&BindKey::of(address))
            .map(|l| l.local_addrs.clone())
            .unwrap_or_default()
    }

    pub(crate) fn listen_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn v4() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn v6() -> SocketAddr {
        "[::1]:9000".parse().unwrap()
    }

    fn unsupported() -> io::Error {
        io::Error::from_raw_os_error(libc::EAFNOSUPPORT)
    }

    #[test]
    fn test_family_unsupported_matches_only_that_errno() {
        assert!(is_family_unsupported(&unsupported()));
        assert!(!is_family_unsupported(&io::Error::from_raw_os_error(libc::EADDRINUSE)));
        assert!(!is_family_unsupported(&io::Error::new(io::ErrorKind::Other, "x")));
    }

    #[test]
    fn test_rejected_family_is_skipped_on_later_binds() {
        // Arrange: the OS refuses IPv6.
        let families = AddressFamilies::new();
        let attempts = Cell::new(0);
        let open = |addr: SocketAddr| {
            attempts.set(attempts.get() + 1);
            if addr.is_ipv6() {
                Err(unsupported())
            } else {
                Ok(addr)
            }
        };

        // Act
        let first = families.open_each("tcp://localhost:9000", vec![v6(), v4()], open);
        let second = families.open_each("tcp://localhost:9000", vec![v6(), v4()], open);

        // Assert: both binds succeed on IPv4; IPv6 was only tried once.
        assert_eq!(first.unwrap(), vec![v4()]);
        assert_eq!(second.unwrap(), vec![v4()]);
        assert_eq!(attempts.get(), 3);
        assert!(families.is_disabled(Family::V6));
        assert!(!families.is_disabled(Family::V4));
    }

    #[test]
    fn test_only_unsupported_families_fails_with_unsupported_family() {
        let families = AddressFamilies::new();

        let result = families.open_each("udp://[::1]:9000", vec![v6()], |_| {
            Err::<SocketAddr, _>(unsupported())
        });

        assert!(matches!(
            result,
            Err(BindError::UnsupportedFamily { ref address }) if address == "udp://[::1]:9000"
        ));
    }

    #[test]
    fn test_other_listen_failure_fails_the_bind() {
        let families = AddressFamilies::new();

        let result = families.open_each("tcp://127.0.0.1:9000", vec![v4()], |_| {
            Err::<SocketAddr, _>(io::Error::from(io::ErrorKind::AddrInUse))
        });

        assert!(matches!(result, Err(BindError::AddressInUse { .. })));
        assert!(!families.is_disabled(Family::V4));
    }
}
