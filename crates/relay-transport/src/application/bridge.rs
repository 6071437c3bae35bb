//! Handlers that turn a lower session into a bridge session for a layer.
//!
//! A protocol layer never owns sockets.  Instead it binds (or dials) its
//! nested transport address with one of these handlers.  When the lower
//! session opens, the handler creates the upper bridge session on the same
//! worker, attaches it as the lower session's child and starts it:
//!
//! ```text
//!   lower session opened
//!     └─ attach child → initializer → created → opened
//!   lower message_received ──────────▶ child message_received
//!   lower closed ────────────────────▶ child closed (first)
//! ```
//!
//! Writes and closes on the child travel the other way through
//! [`Session`] itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use relay_core::address::ResourceAddress;
use relay_core::idle::IdleConfig;

use super::layer::ProtocolLayer;
use crate::domain::handler::{BoundHandler, IoHandler, SessionInitializer};
use crate::domain::session::Session;
use crate::domain::transport::HandlerRegistry;
use crate::runtime::worker::WorkerContext;

/// Lower-level handler for every connection accepted on one nested
/// transport address of a layer.
pub(crate) struct BridgeAcceptHandler {
    layer: Arc<dyn ProtocolLayer>,
    registry: Arc<HandlerRegistry>,
    routes: Mutex<BTreeSet<ResourceAddress>>,
    default_idle: IdleConfig,
}

impl BridgeAcceptHandler {
    pub(crate) fn new(
        layer: Arc<dyn ProtocolLayer>,
        registry: Arc<HandlerRegistry>,
        default_idle: IdleConfig,
    ) -> Self {
        Self {
            layer,
            registry,
            routes: Mutex::new(BTreeSet::new()),
            default_idle,
        }
    }

    pub(crate) fn add_route(&self, address: &ResourceAddress) {
        self.routes.lock().insert(address.without_alternates());
    }

    /// Returns `true` when no route is left.
    pub(crate) fn remove_route(&self, address: &ResourceAddress) -> bool {
        let mut routes = self.routes.lock();
        routes.remove(address);
        routes.is_empty()
    }

    pub(crate) fn routes(&self) -> Vec<ResourceAddress> {
        self.routes.lock().iter().cloned().collect()
    }
}

impl IoHandler for BridgeAcceptHandler {
    fn session_opened(&self, cx: &WorkerContext, parent: &Session) {
        let candidates = self.routes();
        let Some(route) = self.layer.route(parent, &candidates) else {
            warn!(session = %parent.id(), layer = self.layer.scheme(), "no route for connection; closing");
            let _ = parent.close(cx);
            return;
        };
        let Some(binding) = self.registry.lookup(&route) else {
            debug!(session = %parent.id(), %route, "route unbound before open; closing");
            let _ = parent.close(cx);
            return;
        };

        let target = binding.target().clone();
        let local = binding.address().clone();
        let remote = layered_peer(self.layer.scheme(), parent.remote_address(), local.path());
        let idle = IdleConfig::from_options(local.options()).or(self.default_idle);
        let child = Session::bridge(parent, local, remote, Arc::clone(target.handler()), idle);
        open_bridge(cx, parent, &child, target.initializer());
    }

    fn message_received(&self, cx: &WorkerContext, parent: &Session, data: Bytes) {
        forward(cx, parent, data);
    }
}

/// Lower-level handler for one outbound connection of a layer.
pub(crate) struct BridgeConnectHandler {
    address: ResourceAddress,
    target: BoundHandler,
    default_idle: IdleConfig,
}

impl BridgeConnectHandler {
    pub(crate) fn new(address: ResourceAddress, target: BoundHandler, default_idle: IdleConfig) -> Self {
        Self {
            address,
            target,
            default_idle,
        }
    }
}

impl IoHandler for BridgeConnectHandler {
    fn session_opened(&self, cx: &WorkerContext, parent: &Session) {
        let local = layered_peer(self.address.scheme(), parent.local_address(), self.address.path());
        let idle = IdleConfig::from_options(self.address.options()).or(self.default_idle);
        let child = Session::bridge(
            parent,
            local,
            self.address.clone(),
            Arc::clone(self.target.handler()),
            idle,
        );
        open_bridge(cx, parent, &child, self.target.initializer());
    }

    fn message_received(&self, cx: &WorkerContext, parent: &Session, data: Bytes) {
        forward(cx, parent, data);
    }
}

fn open_bridge(
    cx: &WorkerContext,
    parent: &Session,
    child: &Session,
    initializer: Option<&Arc<dyn SessionInitializer>>,
) {
    parent.attach_child(child);
    if let Some(initializer) = initializer {
        child.initialize(cx, initializer);
    }
    child.fire_created(cx);
    child.fire_opened(cx);
    child.refresh_effective_idle();
}

fn forward(cx: &WorkerContext, parent: &Session, data: Bytes) {
    match parent.child() {
        Some(child) => child.deliver_received(cx, data),
        None => trace!(session = %parent.id(), bytes = data.len(), "no bridge session; bytes dropped"),
    }
}

/// `scheme://host:port/path` of the lower address, layered over it.
fn layered_peer(scheme: &str, lower: &ResourceAddress, path: &str) -> ResourceAddress {
    ResourceAddress::new(scheme, lower.host(), lower.port(), path).with_transport(lower.clone())
}
