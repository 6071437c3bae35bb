//! UDP acceptor and connector.
//!
//! UDP has no connections, so the acceptor makes its own: datagrams are
//! demultiplexed by peer address, and the first datagram from a new peer
//! creates a session for it on the least-loaded worker.  From then on that
//! peer's datagrams are queued to its session and replies go out through
//! the shared listening socket.
//!
//! Every address the host resolves to gets its own socket; families the OS
//! rejects are skipped as for TCP.
//!
//! A peer session lives until its handler closes it (typically on idle) or
//! the listener closes.  A later datagram from the same peer then starts a
//! fresh session.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use relay_core::address::ResourceAddress;
use relay_core::affinity::WorkerId;
use relay_core::binding::{BindKey, Binding, NextProtocolBindings};
use relay_core::error::{BindError, ConnectError, UnbindError};
use relay_core::idle::IdleConfig;

use super::driver::{serve_accepted, serve_connected, AcceptContext, Connection};
use super::io::{connected_udp, DatagramInbound, DatagramOutbound};
use super::listener::{AddressFamilies, ListenerHandle, PhysicalBindings};
use crate::domain::handler::BoundHandler;
use crate::domain::session::Session;
use crate::domain::transport::{Transport, TransportContext};
use crate::runtime::future::promise;

pub const SCHEME: &str = "udp";

const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagrams queued per peer before new ones are dropped.
const PEER_QUEUE: usize = 256;

/// Listens on and dials UDP addresses.
pub struct UdpTransport {
    context: TransportContext,
    bindings: PhysicalBindings,
    families: AddressFamilies,
}

impl UdpTransport {
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
        let sockets = self.families.open_each(&uri, resolved, open_socket)?;

        let (stop, stop_rx) = watch::channel(false);
        let mut local_addrs = Vec::new();
        let mut tasks = Vec::new();
        for socket in sockets {
            if let Ok(local) = socket.local_addr() {
                local_addrs.push(local);
            }
            let accept = AcceptContext {
                registry: Arc::clone(self.bindings.registry()),
                key: key.clone(),
                transport: self.context.clone(),
            };
            let task = self
                .context
                .boss
                .spawn(receive_loop(Arc::new(socket), accept, stop_rx.clone()));
            tasks.push(task);
        }
        Ok(ListenerHandle::new(local_addrs, stop, tasks))
    }
}

#[async_trait]
impl Transport for UdpTransport {
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
        let peer = lookup_host(address.authority())
            .await
            .map_err(|source| ConnectError::UnresolvedHost {
                address: uri.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ConnectError::UnresolvedHost {
                address: uri.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
            })?;

        let lease = self.context.pool.next_worker(affinity);
        let worker = lease.worker().clone();
        let cancelled = uri.clone();
        let (opened, session) = promise(move || ConnectError::Cancelled { address: cancelled });
        let context = self.context.clone();
        let remote = address.clone();
        let idle = IdleConfig::from_options(address.options());

        worker
            .spawn(move |cx| async move {
                let socket = match dial(peer).await {
                    Ok(socket) => socket,
                    Err(source) => {
                        opened.complete(Err(ConnectError::Dial { address: uri, source }));
                        return;
                    }
                };
                let local = match socket.local_addr() {
                    Ok(addr) => socket_address(addr),
                    Err(_) => remote.clone(),
                };
                let (inbound, outbound) = connected_udp(socket, MAX_DATAGRAM);
                let connection = Connection {
                    remote,
                    inbound: Box::new(inbound),
                    outbound: Box::new(outbound),
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

/// Binds a listening socket on the current (boss) runtime.
fn open_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

async fn dial(peer: SocketAddr) -> io::Result<UdpSocket> {
    let any: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(any).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

fn socket_address(addr: SocketAddr) -> ResourceAddress {
    ResourceAddress::new(SCHEME, addr.ip().to_string(), Some(addr.port()), "")
}

async fn receive_loop(socket: Arc<UdpSocket>, accept: AcceptContext, mut stop: watch::Receiver<bool>) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors surface here on some platforms.
                        debug!(key = %accept.key, error = %e, "udp receive failed");
                        continue;
                    }
                };
                let datagram = Bytes::copy_from_slice(&buffer[..n]);
                let tx = match peers.get(&peer) {
                    Some(tx) if !tx.is_closed() => tx.clone(),
                    _ => match open_peer(&socket, peer, &accept) {
                        Some(tx) => {
                            peers.insert(peer, tx.clone());
                            tx
                        }
                        None => {
                            peers.remove(&peer);
                            continue;
                        }
                    },
                };
                if tx.try_send(datagram).is_err() {
                    trace!(%peer, "peer queue full; datagram dropped");
                }
            }
            _ = stop.changed() => break,
        }
        peers.retain(|_, tx| !tx.is_closed());
    }
    debug!(key = %accept.key, "udp receive loop stopped");
}

/// Starts a session for a new peer and returns its datagram queue.
fn open_peer(
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    accept: &AcceptContext,
) -> Option<mpsc::Sender<Bytes>> {
    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    let lease = accept.transport.pool.next_worker(None);
    let worker = lease.worker().clone();
    let context = AcceptContext {
        registry: Arc::clone(&accept.registry),
        key: accept.key.clone(),
        transport: accept.transport.clone(),
    };
    let socket = Arc::clone(socket);
    let posted = worker.spawn(move |cx| async move {
        let connection = Connection {
            remote: socket_address(peer),
            inbound: Box::new(DatagramInbound::new(rx)),
            outbound: Box::new(DatagramOutbound::new(socket, peer)),
        };
        serve_accepted(cx, lease, context, connection).await;
    });
    match posted {
        Ok(()) => Some(tx),
        Err(e) => {
            warn!(%peer, error = %e, "no worker for udp peer");
            None
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_socket_on_ephemeral_port() {
        let socket = open_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_dial_connects_to_peer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = server.local_addr().unwrap();

        let client = dial(peer).await.unwrap();
        client.send(b"ping").await.unwrap();

        let mut buf = [0u8; 8];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), client.local_addr().unwrap().port());
    }
}
