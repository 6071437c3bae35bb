//! TCP acceptor and connector.
//!
//! # Threading
//!
//! Accept loops run on the service's own ("boss") runtime and never touch a
//! handler.  Each accepted stream is detached from the boss reactor, sent to
//! the least-loaded worker and re-registered there, so every byte of that
//! connection is read, dispatched and written on one worker thread.
//!
//! Outbound connections are dialled directly on the chosen worker; passing
//! the caller's worker as `affinity` keeps a relay's two legs together.
//!
//! A host resolving to several addresses gets one listener per address;
//! families the OS rejects are skipped (see [`AddressFamilies`]).
//!
//! [`AddressFamilies`]: super::listener::AddressFamilies

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use relay_core::address::ResourceAddress;
use relay_core::affinity::WorkerId;
use relay_core::binding::{BindKey, Binding, NextProtocolBindings};
use relay_core::error::{BindError, ConnectError, UnbindError};
use relay_core::idle::IdleConfig;

use super::driver::{serve_accepted, serve_connected, AcceptContext, Connection};
use super::io::{StreamInbound, StreamOutbound};
use super::listener::{AddressFamilies, ListenerHandle, PhysicalBindings};
use crate::domain::handler::BoundHandler;
use crate::domain::session::Session;
use crate::domain::transport::{Transport, TransportContext};
use crate::runtime::future::promise;

pub const SCHEME: &str = "tcp";

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Listens on and dials TCP addresses.
pub struct TcpTransport {
    context: TransportContext,
    bindings: PhysicalBindings,
    families: AddressFamilies,
}

impl TcpTransport {
    pub fn new(context: TransportContext) -> Self {
        Self {
            context,
            bindings: PhysicalBindings::new(SCHEME),
            families: AddressFamilies::new(),
        }
    }

    async fn listen(&self, address: &ResourceAddress, key: BindKey) -> Result<ListenerHandle, BindError> {
        let uri = address.uri().to_string();
        let resolved = AddressFamilies::resolve(address).await?;
        let backlog = self.context.config.listen_backlog;
        let listeners = self
            .families
            .open_each(&uri, resolved, |addr| open_listener(addr, backlog))?;

        let (stop, stop_rx) = watch::channel(false);
        let mut local_addrs = Vec::new();
        let mut tasks = Vec::new();
        for listener in listeners {
            if let Ok(local) = listener.local_addr() {
                local_addrs.push(local);
            }
            let accept = AcceptContext {
                registry: Arc::clone(self.bindings.registry()),
                key: key.clone(),
                transport: self.context.clone(),
            };
            let task = self.context.boss.spawn(accept_loop(
                listener,
                key.clone(),
                stop_rx.clone(),
                move |stream, peer| hand_off(stream, peer, &accept),
            ));
            tasks.push(task);
        }
        Ok(ListenerHandle::new(local_addrs, stop, tasks))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn bind(&self, address: &ResourceAddress, target: BoundHandler) -> Result<(), BindError> {
        if self.context.is_shutting_down() {
            return Err(BindError::Shutdown {
                address: address.uri().to_string(),
            });
        }
        self.bindings
            .bind(address, target, |key| self.listen(address, key))
            .await?;
        self.context
            .warn_shadowed_fallbacks(address, self.bindings.bindings_at(address));
        Ok(())
    }

    async fn unbind(&self, address: &ResourceAddress) -> Result<(), UnbindError> {
        self.bindings.unbind(address).await
    }

    async fn connect(
        &self,
        address: &ResourceAddress,
        target: BoundHandler,
        affinity: Option<WorkerId>,
    ) -> Result<Session, ConnectError> {
        let uri = address.uri().to_string();
        if self.context.is_shutting_down() {
            return Err(ConnectError::Shutdown { address: uri });
        }
        let addrs: Vec<SocketAddr> = lookup_host(address.authority())
            .await
            .map_err(|source| ConnectError::UnresolvedHost {
                address: uri.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::UnresolvedHost {
                address: uri.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
            });
        }

        let lease = self.context.pool.next_worker(affinity);
        let worker = lease.worker().clone();
        let cancelled = uri.clone();
        let (opened, session) = promise(move || ConnectError::Cancelled { address: cancelled });
        let context = self.context.clone();
        let remote = address.clone();
        let idle = IdleConfig::from_options(address.options());
        let buffer = self.context.config.read_buffer_size;

        worker
            .spawn(move |cx| async move {
                let mut last_error = None;
                let mut stream = None;
                for addr in addrs {
                    match TcpStream::connect(addr).await {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
                let Some(stream) = stream else {
                    let source = last_error.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::NotConnected, "no address could be dialled")
                    });
                    opened.complete(Err(ConnectError::Dial { address: uri, source }));
                    return;
                };
                let _ = stream.set_nodelay(true);
                let local = match stream.local_addr() {
                    Ok(addr) => socket_address(addr),
                    Err(_) => remote.clone(),
                };
                debug!(%remote, worker = %cx.worker(), "tcp connection established");
                let (read, write) = stream.into_split();
                let connection = Connection {
                    remote,
                    inbound: Box::new(StreamInbound::new(read, buffer)),
                    outbound: Box::new(StreamOutbound::new(write)),
                };
                serve_connected(cx, lease, local, target, context, connection, idle, opened).await;
            })
            .map_err(|_| ConnectError::Shutdown {
                address: address.uri().to_string(),
            })?;
        session.await
    }

    fn lookup(&self, address: &ResourceAddress) -> Option<Binding<BoundHandler>> {
        self.bindings.lookup(address)
    }

    fn bindings_at(&self, address: &ResourceAddress) -> Option<NextProtocolBindings<BoundHandler>> {
        self.bindings.bindings_at(address)
    }

    fn local_addrs(&self, address: &ResourceAddress) -> Vec<SocketAddr> {
        self.bindings.local_addrs(address)
    }

    fn listen_count(&self) -> usize {
        self.bindings.listen_count()
    }

    async fn dispose(&self) {
        self.bindings.dispose().await;
    }
}

fn open_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

pub(crate) fn socket_address(addr: SocketAddr) -> ResourceAddress {
    ResourceAddress::new(SCHEME, addr.ip().to_string(), Some(addr.port()), "")
}

/// Source of inbound streams for [`accept_loop`].
#[async_trait]
trait Accept: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<L, F>(listener: L, key: BindKey, mut stop: watch::Receiver<bool>, mut on_accept: F)
where
    L: Accept,
    F: FnMut(TcpStream, SocketAddr) + Send,
{
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => on_accept(stream, peer),
                Err(e) => {
                    // Transient (e.g. out of descriptors); keep accepting.
                    warn!(%key, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!(%key, "accept loop stopped");
}

/// Moves an accepted stream to its worker and starts serving it there.
fn hand_off(stream: TcpStream, peer: SocketAddr, accept: &AcceptContext) {
    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, error = %e, "could not detach accepted stream");
            return;
        }
    };
    let lease = accept.transport.pool.next_worker(None);
    let worker = lease.worker().clone();
    let context = AcceptContext {
        registry: Arc::clone(&accept.registry),
        key: accept.key.clone(),
        transport: accept.transport.clone(),
    };
    let buffer = context.transport.config.read_buffer_size;

    let posted = worker.spawn(move |cx| async move {
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "could not register stream on worker");
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let connection = Connection {
            remote: socket_address(peer),
            inbound: Box::new(StreamInbound::new(read, buffer)),
            outbound: Box::new(StreamOutbound::new(write)),
        };
        serve_accepted(cx, lease, context, connection).await;
    });
    if posted.is_err() {
        debug!(%peer, "worker stopped; connection dropped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_socket_address_brackets_ipv6() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(socket_address(addr).uri(), "tcp://[::1]:9000");
    }

    /// Fails every accept, as a listener out of file descriptors does.
    struct Exhausted {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Accept for Exhausted {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }
    }

    #[tokio::test]
    async fn test_failing_accept_backs_off_instead_of_spinning() {
        // Arrange
        let calls = Arc::new(AtomicUsize::new(0));
        let (stop, stop_rx) = watch::channel(false);
        let key = BindKey::of(&socket_address("127.0.0.1:9000".parse().unwrap()));
        let listener = Exhausted {
            calls: Arc::clone(&calls),
        };

        // Act
        let task = tokio::spawn(accept_loop(listener, key, stop_rx, |_, _| {}));
        tokio::time::sleep(Duration::from_millis(220)).await;
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("accept loop stops")
            .unwrap();

        // Assert: roughly one attempt per backoff period.
        let attempts = calls.load(Ordering::SeqCst);
        assert!((2..=10).contains(&attempts), "accept attempted {attempts} times");
    }

    #[tokio::test]
    async fn test_open_listener_on_ephemeral_port() {
        let listener = open_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
