//! A [`Transport`] for one protocol layer.
//!
//! Binding `alpha://h:9000/x` does three things:
//!
//! 1. records the binding in the layer's own registry (conflicts are caught
//!    here, before anything below is touched);
//! 2. adds `/x` as a route of the bridge handler cached for the nested
//!    address `tcp://h:9000 (next protocol alpha)`;
//! 3. binds the nested address with that cached handler.  Because the same
//!    handler is passed every time, the lower registry counts a reference
//!    instead of reporting a conflict, and only the very first bind opens a
//!    socket.
//!
//! Unbinding reverses the steps.  The nested address is unbound once per
//! layer unbind, so the physical listener closes exactly when the last
//! layer binding above it goes away.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use relay_core::address::ResourceAddress;
use relay_core::affinity::WorkerId;
use relay_core::binding::{BindKey, Binding, NextProtocolBindings, UnbindOutcome};
use relay_core::error::{BindError, ConnectError, UnbindError};
use relay_core::idle::IdleConfig;

use super::bridge::{BridgeAcceptHandler, BridgeConnectHandler};
use super::layer::ProtocolLayer;
use crate::domain::handler::{BoundHandler, IoHandler};
use crate::domain::session::Session;
use crate::domain::transport::{HandlerRegistry, Transport, TransportTable};

struct CachedBridge {
    bridge: Arc<BridgeAcceptHandler>,
    target: BoundHandler,
}

/// Binds and dials the addresses of one [`ProtocolLayer`].
pub struct LayeredTransport {
    layer: Arc<dyn ProtocolLayer>,
    registry: Arc<HandlerRegistry>,
    bridges: Mutex<HashMap<ResourceAddress, CachedBridge>>,
    transports: Weak<TransportTable>,
    default_idle: IdleConfig,
    op_lock: tokio::sync::Mutex<()>,
}

impl LayeredTransport {
    pub fn new(
        layer: Arc<dyn ProtocolLayer>,
        transports: Weak<TransportTable>,
        default_idle: IdleConfig,
    ) -> Self {
        Self {
            layer,
            registry: Arc::new(HandlerRegistry::new()),
            bridges: Mutex::new(HashMap::new()),
            transports,
            default_idle,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn layer(&self) -> &Arc<dyn ProtocolLayer> {
        &self.layer
    }

    fn lower(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        let transports = self.transports.upgrade()?;
        let lower = transports.get(scheme).map(|t| Arc::clone(t.value()));
        lower
    }

    /// The handler bound on `transport`, created on first use.
    fn bridge_for(&self, transport: &ResourceAddress) -> (Arc<BridgeAcceptHandler>, BoundHandler) {
        let mut bridges = self.bridges.lock();
        let cached = bridges.entry(transport.clone()).or_insert_with(|| {
            let bridge = Arc::new(BridgeAcceptHandler::new(
                Arc::clone(&self.layer),
                Arc::clone(&self.registry),
                self.default_idle,
            ));
            let handler: Arc<dyn IoHandler> = bridge.clone();
            CachedBridge {
                bridge,
                target: BoundHandler::new(handler, None),
            }
        });
        (Arc::clone(&cached.bridge), cached.target.clone())
    }

    /// Drops `address`'s route; forgets the bridge when it has none left.
    fn release_route(&self, transport: &ResourceAddress, address: &ResourceAddress) {
        let mut bridges = self.bridges.lock();
        let empty = bridges
            .get(transport)
            .map(|cached| cached.bridge.remove_route(address))
            .unwrap_or(false);
        if empty {
            bridges.remove(transport);
        }
    }
}

fn nested(address: &ResourceAddress) -> Result<&ResourceAddress, (String, String)> {
    address
        .transport()
        .ok_or_else(|| (address.uri().to_string(), address.scheme().to_string()))
}

#[async_trait]
impl Transport for LayeredTransport {
    fn scheme(&self) -> &str {
        self.layer.scheme()
    }

    async fn bind(&self, address: &ResourceAddress, target: BoundHandler) -> Result<(), BindError> {
        let _guard = self.op_lock.lock().await;
        let transport = nested(address)
            .map_err(|(address, scheme)| BindError::UnsupportedScheme { address, scheme })?;
        let lower = self
            .lower(transport.scheme())
            .ok_or_else(|| BindError::UnsupportedScheme {
                address: transport.uri().to_string(),
                scheme: transport.scheme().to_string(),
            })?;

        let outcome = self.registry.bind(address, target)?;
        let (bridge, bridge_target) = self.bridge_for(transport);
        bridge.add_route(address);

        if let Err(e) = lower.bind(transport, bridge_target).await {
            if let UnbindOutcome::Released { remaining_refs: 0, .. } = self.registry.unbind(address) {
                self.release_route(transport, address);
            }
            return Err(e);
        }
        debug!(
            layer = self.layer.scheme(),
            %address,
            over = %transport,
            refs = outcome.ref_count,
            "layer bound"
        );
        Ok(())
    }

    async fn unbind(&self, address: &ResourceAddress) -> Result<(), UnbindError> {
        let _guard = self.op_lock.lock().await;
        let Some(transport) = address.transport() else {
            return Ok(());
        };
        match self.registry.unbind(address) {
            UnbindOutcome::NotBound => {
                debug!(%address, "unbind of an unbound layer address ignored");
                Ok(())
            }
            UnbindOutcome::Released { remaining_refs, .. } => {
                if remaining_refs == 0 {
                    self.release_route(transport, address);
                }
                match self.lower(transport.scheme()) {
                    Some(lower) => lower.unbind(transport).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn connect(
        &self,
        address: &ResourceAddress,
        target: BoundHandler,
        affinity: Option<WorkerId>,
    ) -> Result<Session, ConnectError> {
        let transport = nested(address)
            .map_err(|(address, scheme)| ConnectError::UnsupportedScheme { address, scheme })?;
        let lower = self
            .lower(transport.scheme())
            .ok_or_else(|| ConnectError::UnsupportedScheme {
                address: transport.uri().to_string(),
                scheme: transport.scheme().to_string(),
            })?;
        let handler = Arc::new(BridgeConnectHandler::new(
            address.clone(),
            target,
            self.default_idle,
        ));
        let parent = lower
            .connect(transport, BoundHandler::new(handler, None), affinity)
            .await?;
        parent.child().ok_or_else(|| ConnectError::Closed {
            address: address.uri().to_string(),
        })
    }

    fn lookup(&self, address: &ResourceAddress) -> Option<Binding<BoundHandler>> {
        self.registry.lookup(address)
    }

    fn bindings_at(&self, address: &ResourceAddress) -> Option<NextProtocolBindings<BoundHandler>> {
        self.registry.bindings_at(&BindKey::of(address))
    }

    async fn dispose(&self) {
        let _guard = self.op_lock.lock().await;
        self.registry.clear();
        self.bridges.lock().clear();
        info!(layer = self.layer.scheme(), "layer disposed");
    }
}
