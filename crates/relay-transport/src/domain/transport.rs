//! The per-scheme transport contract and the state every physical transport
//! shares.
//!
//! A [`Transport`] serves one URI scheme.  Physical transports (`tcp`,
//! `udp`, `pipe`) own sockets; layered transports (`alpha`, `ws`, ...) own
//! no sockets and delegate to the transport of their nested address.  The
//! [`TransportService`](crate::TransportService) picks the transport by the
//! address scheme and never needs to know which kind it got.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::warn;

use relay_core::address::ResourceAddress;
use relay_core::affinity::WorkerId;
use relay_core::binding::{Binding, BindingRegistry, NextProtocolBindings};
use relay_core::dispatch::{DispatchCandidate, ProtocolSniffer};
use relay_core::error::{BindError, ConnectError, UnbindError};

use super::config::TransportConfig;
use super::handler::BoundHandler;
use super::session::Session;
use crate::runtime::idle_tracker::IdleTracker;
use crate::runtime::pool::AffinityPool;

/// Binds, unbinds and dials addresses of one scheme.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The URI scheme served (`tcp`, `pipe`, `alpha`, ...).
    fn scheme(&self) -> &str;

    /// Registers `target` at `address`, listening physically if this is the
    /// first binding on the address's authority.
    ///
    /// # Errors
    ///
    /// [`BindError::Conflict`] when another handler owns the slot, or the
    /// listen failure kinds of [`BindError`].
    async fn bind(&self, address: &ResourceAddress, target: BoundHandler) -> Result<(), BindError>;

    /// Releases one reference to `address`.  Not being bound is not an error.
    ///
    /// # Errors
    ///
    /// Only for malformed requests; see [`UnbindError`].
    async fn unbind(&self, address: &ResourceAddress) -> Result<(), UnbindError>;

    /// Dials `address` and returns the open session.
    ///
    /// `affinity` pins the new connection to a worker, typically the caller's
    /// own.
    ///
    /// # Errors
    ///
    /// The dial failure kinds of [`ConnectError`].
    async fn connect(
        &self,
        address: &ResourceAddress,
        target: BoundHandler,
        affinity: Option<WorkerId>,
    ) -> Result<Session, ConnectError>;

    /// The binding owning exactly `address`.
    fn lookup(&self, address: &ResourceAddress) -> Option<Binding<BoundHandler>>;

    /// Every binding sharing `address`'s authority, before dispatch.
    fn bindings_at(&self, address: &ResourceAddress) -> Option<NextProtocolBindings<BoundHandler>>;

    /// Socket addresses actually listened on for `address` (resolves port 0).
    fn local_addrs(&self, _address: &ResourceAddress) -> Vec<SocketAddr> {
        Vec::new()
    }

    /// Number of physical listeners currently open.
    fn listen_count(&self) -> usize {
        0
    }

    /// Closes every listener and forgets every binding.
    async fn dispose(&self);
}

/// State shared by the physical transports of one service.
#[derive(Clone)]
pub struct TransportContext {
    pub pool: Arc<AffinityPool>,
    pub tracker: IdleTracker,
    pub sniffers: Arc<SnifferTable>,
    pub config: Arc<TransportConfig>,
    /// Runtime that runs accept loops and datagram sockets.
    pub boss: Handle,
    /// Flips to `true` when the service is disposed.
    pub shutdown: watch::Receiver<bool>,
}

impl TransportContext {
    /// Dispatch candidates for the protocols bound on one authority.
    ///
    /// A protocol with a registered sniffer is identified from its first
    /// bytes; anything else is the fallback.
    pub fn candidates(&self, protocols: &[Option<String>]) -> Vec<DispatchCandidate> {
        protocols
            .iter()
            .map(|protocol| match sniffer_for(&self.sniffers, protocol.as_deref()) {
                Some(sniffer) => DispatchCandidate::sniffed(protocol.clone(), sniffer),
                None => DispatchCandidate::fallback(protocol.clone()),
            })
            .collect()
    }

    /// Warns when several protocols bound on `address`'s authority have no
    /// sniffer.  Only the first of them by name can ever be dispatched to.
    pub fn warn_shadowed_fallbacks(
        &self,
        address: &ResourceAddress,
        bindings: Option<NextProtocolBindings<BoundHandler>>,
    ) {
        let Some(bindings) = bindings else {
            return;
        };
        let shadowed = shadowed_fallbacks(&self.sniffers, &bindings.protocols());
        if !shadowed.is_empty() {
            warn!(
                %address,
                ?shadowed,
                "several protocols here have no sniffer; these can never be dispatched to"
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Sniffers by protocol name.
pub type SnifferTable = DashMap<String, Arc<dyn ProtocolSniffer>>;

fn sniffer_for(sniffers: &SnifferTable, protocol: Option<&str>) -> Option<Arc<dyn ProtocolSniffer>> {
    protocol.and_then(|name| sniffers.get(name).map(|s| Arc::clone(s.value())))
}

/// Fallback protocols that lose to an earlier fallback, in name order.
fn shadowed_fallbacks(sniffers: &SnifferTable, protocols: &[Option<String>]) -> Vec<Option<String>> {
    let mut fallbacks: Vec<Option<String>> = protocols
        .iter()
        .filter(|protocol| sniffer_for(sniffers, protocol.as_deref()).is_none())
        .cloned()
        .collect();
    fallbacks.sort();
    fallbacks.dedup();
    fallbacks.into_iter().skip(1).collect()
}

/// Convenience alias for the per-transport binding table.
pub type HandlerRegistry = BindingRegistry<BoundHandler>;

/// Every transport of a service, keyed by scheme.
pub type TransportTable = DashMap<String, Arc<dyn Transport>>;

// ── Tests ─────────────────────────────────────────────────────────────────────
