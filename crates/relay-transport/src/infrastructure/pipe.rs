//! In-process named pipes (`pipe://name`).
//!
//! A pipe "listener" is just a name in the binding table; connecting creates
//! an in-memory duplex stream and serves both ends like any other accepted
//! and dialled connection, each on its own worker.  Pipes need no ports or
//! file descriptors, which makes them handy for links inside one gateway and
//! for tests that open thousands of connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use relay_core::address::ResourceAddress;
use relay_core::affinity::WorkerId;
use relay_core::binding::{BindKey, Binding, NextProtocolBindings};
use relay_core::error::{BindError, ConnectError, UnbindError};
use relay_core::idle::IdleConfig;

use super::driver::{serve_accepted, serve_connected, AcceptContext, Connection};
use super::io::{StreamInbound, StreamOutbound};
use super::listener::{ListenerHandle, PhysicalBindings};
use crate::domain::handler::BoundHandler;
use crate::domain::session::Session;
use crate::domain::transport::{Transport, TransportContext};
use crate::runtime::future::promise;

pub const SCHEME: &str = "pipe";

/// Binds and connects in-process pipes.
pub struct PipeTransport {
    context: TransportContext,
    bindings: PhysicalBindings,
    next_client: AtomicU64,
}

impl PipeTransport {
    pub fn new(context: TransportContext) -> Self {
        Self {
            context,
            bindings: PhysicalBindings::new(SCHEME),
            next_client: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
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
            .bind(address, target, |_key| async { Ok::<_, BindError>(ListenerHandle::detached()) })
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
        let key = BindKey::of(address);
        if !self.bindings.registry().is_bound(&key) {
            return Err(ConnectError::Refused { address: uri });
        }

        let buffer = self.context.config.read_buffer_size;
        let (client_end, server_end) = tokio::io::duplex(buffer);
        let n = self.next_client.fetch_add(1, Ordering::Relaxed);
        let client_address = ResourceAddress::new(SCHEME, format!("{}-client-{n}", address.host()), None, "");

        // Server side: an ordinary accepted connection.
        let server_lease = self.context.pool.next_worker(None);
        let server_worker = server_lease.worker().clone();
        let accept = AcceptContext {
            registry: Arc::clone(self.bindings.registry()),
            key,
            transport: self.context.clone(),
        };
        let peer = client_address.clone();
        server_worker
            .spawn(move |cx| async move {
                let (read, write) = tokio::io::split(server_end);
                let connection = Connection {
                    remote: peer,
                    inbound: Box::new(StreamInbound::new(read, buffer)),
                    outbound: Box::new(StreamOutbound::new(write)),
                };
                serve_accepted(cx, server_lease, accept, connection).await;
            })
            .map_err(|_| ConnectError::Shutdown { address: uri.clone() })?;

        // Client side.
        let lease = self.context.pool.next_worker(affinity);
        let worker = lease.worker().clone();
        let cancelled = uri.clone();
        let (opened, session) = promise(move || ConnectError::Cancelled { address: cancelled });
        let context = self.context.clone();
        let remote = address.clone();
        let idle = IdleConfig::from_options(address.options());
        debug!(pipe = %address, client = %client_address, "pipe connected");
        worker
            .spawn(move |cx| async move {
                let (read, write) = tokio::io::split(client_end);
                let connection = Connection {
                    remote,
                    inbound: Box::new(StreamInbound::new(read, buffer)),
                    outbound: Box::new(StreamOutbound::new(write)),
                };
                serve_connected(cx, lease, client_address, target, context, connection, idle, opened).await;
            })
            .map_err(|_| ConnectError::Shutdown { address: uri })?;
        session.await
    }

    fn lookup(&self, address: &ResourceAddress) -> Option<Binding<BoundHandler>> {
        self.bindings.lookup(address)
    }

    fn bindings_at(&self, address: &ResourceAddress) -> Option<NextProtocolBindings<BoundHandler>> {
        self.bindings.bindings_at(address)
    }

    fn listen_count(&self) -> usize {
        self.bindings.listen_count()
    }

    async fn dispose(&self) {
        self.bindings.dispose().await;
    }
}
