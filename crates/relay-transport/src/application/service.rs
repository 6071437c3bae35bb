//! `TransportService`: the one object upper layers talk to.
//!
//! The service owns everything with a lifecycle: the worker pool, the idle
//! tracker, the unbind executor and one transport per scheme.  It is created
//! explicitly, shared by cloning, and torn down with
//! [`dispose`](TransportService::dispose).
//!
//! # Operation handles
//!
//! `bind`, `unbind` and `connect` return immediately with a future-like
//! handle ([`BindFuture`], [`UnbindFuture`], [`ConnectFuture`]).  The work
//! itself runs elsewhere:
//!
//! | Operation | Runs on                                         |
//! |-----------|-------------------------------------------------|
//! | bind      | the runtime the service was created on          |
//! | connect   | that runtime, then the chosen worker            |
//! | unbind    | the dedicated serial unbind thread              |
//!
//! so a handler may call any of them from inside a callback without
//! blocking its worker.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use relay_core::address::{ResourceAddress, ResourceAddressFactory, ResourceOptions};
use relay_core::affinity::WorkerId;
use relay_core::binding::{Binding, NextProtocolBindings};
use relay_core::dispatch::ProtocolSniffer;
use relay_core::error::{AddressError, BindError, ConnectError, UnbindError};

use super::layer::ProtocolLayer;
use super::layered::LayeredTransport;
use crate::domain::config::TransportConfig;
use crate::domain::handler::{BoundHandler, IoHandler, SessionInitializer};
use crate::domain::transport::{Transport, TransportContext, TransportTable};
use crate::infrastructure::{pipe, tcp, udp, PipeTransport, TcpTransport, UdpTransport};
use crate::runtime::executor::SerialExecutor;
use crate::runtime::future::{promise, BindFuture, ConnectFuture, OpFuture, UnbindFuture};
use crate::runtime::idle_tracker::IdleTracker;
use crate::runtime::pool::AffinityPool;
use crate::runtime::worker::WorkerContext;

const PHYSICAL_SCHEMES: [&str; 3] = [tcp::SCHEME, udp::SCHEME, pipe::SCHEME];

struct ServiceInner {
    config: Arc<TransportConfig>,
    factory: RwLock<ResourceAddressFactory>,
    transports: Arc<TransportTable>,
    sniffers: Arc<DashMap<String, Arc<dyn ProtocolSniffer>>>,
    pool: Arc<AffinityPool>,
    tracker: IdleTracker,
    unbinder: SerialExecutor,
    boss: Handle,
    shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
}

/// Entry point for binding, unbinding and connecting addresses.
///
/// Cheap to clone; all clones share one service.
#[derive(Clone)]
pub struct TransportService {
    inner: Arc<ServiceInner>,
}

impl TransportService {
    /// Starts the worker pool, idle tracker and unbind executor, and
    /// registers the `tcp`, `udp` and `pipe` transports.
    ///
    /// Must be called from within a Tokio runtime; accept loops run on it.
    ///
    /// # Errors
    ///
    /// Fails when called outside a runtime or when a thread cannot be
    /// spawned.
    pub fn new(config: TransportConfig) -> io::Result<Self> {
        let boss = Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let config = Arc::new(config);
        let pool = Arc::new(AffinityPool::new(config.worker_count)?);
        let unbinder = SerialExecutor::new("relay-unbind")?;
        let tracker = IdleTracker::start(&boss, config.idle_tick);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sniffers = Arc::new(DashMap::new());

        let context = TransportContext {
            pool: Arc::clone(&pool),
            tracker: tracker.clone(),
            sniffers: Arc::clone(&sniffers),
            config: Arc::clone(&config),
            boss: boss.clone(),
            shutdown: shutdown_rx,
        };
        let transports: Arc<TransportTable> = Arc::new(DashMap::new());
        transports.insert(
            tcp::SCHEME.to_string(),
            Arc::new(TcpTransport::new(context.clone())) as Arc<dyn Transport>,
        );
        transports.insert(
            udp::SCHEME.to_string(),
            Arc::new(UdpTransport::new(context.clone())) as Arc<dyn Transport>,
        );
        transports.insert(
            pipe::SCHEME.to_string(),
            Arc::new(PipeTransport::new(context)) as Arc<dyn Transport>,
        );

        info!(workers = pool.size(), "transport service started");
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                factory: RwLock::new(ResourceAddressFactory::new()),
                transports,
                sniffers,
                pool,
                tracker,
                unbinder,
                boss,
                shutdown,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    // ── Addresses ─────────────────────────────────────────────────────────────

    /// Parses `uri` into an address chain using the registered schemes.
    ///
    /// # Errors
    ///
    /// See [`ResourceAddressFactory::new_address_with`].
    pub fn address(&self, uri: &str) -> Result<ResourceAddress, AddressError> {
        self.inner.factory.read().new_address(uri)
    }

    /// Like [`address`](Self::address), with options.
    ///
    /// # Errors
    ///
    /// See [`ResourceAddressFactory::new_address_with`].
    pub fn address_with(
        &self,
        uri: &str,
        options: ResourceOptions,
    ) -> Result<ResourceAddress, AddressError> {
        self.inner.factory.read().new_address_with(uri, options)
    }

    /// The first URI as primary, the rest as alternates bound with it.
    ///
    /// # Errors
    ///
    /// See [`ResourceAddressFactory::new_address_with_alternates`].
    pub fn address_with_alternates(
        &self,
        uris: &[&str],
        options: ResourceOptions,
    ) -> Result<ResourceAddress, AddressError> {
        self.inner
            .factory
            .read()
            .new_address_with_alternates(uris, options)
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Makes a protocol layer's scheme bindable and dialable.
    ///
    /// Returns `false` (and changes nothing) when the scheme is already taken.
    pub fn register_layer(&self, layer: Arc<dyn ProtocolLayer>) -> bool {
        let scheme = layer.scheme().to_string();
        if self.inner.transports.contains_key(&scheme) {
            warn!(%scheme, "scheme already registered; layer ignored");
            return false;
        }
        self.inner
            .factory
            .write()
            .register_layer(scheme.clone(), layer.transport_scheme(), layer.default_port());
        if let Some(sniffer) = layer.sniffer() {
            self.inner.sniffers.insert(scheme.clone(), sniffer);
        }
        let transport = LayeredTransport::new(
            Arc::clone(&layer),
            Arc::downgrade(&self.inner.transports),
            self.inner.config.default_idle(),
        );
        self.inner
            .transports
            .insert(scheme.clone(), Arc::new(transport) as Arc<dyn Transport>);
        info!(%scheme, over = layer.transport_scheme(), "protocol layer registered");
        true
    }

    /// Identifies connections for `protocol` bound directly on a physical
    /// address (without a layer).
    pub fn register_sniffer(&self, protocol: impl Into<String>, sniffer: Arc<dyn ProtocolSniffer>) {
        self.inner.sniffers.insert(protocol.into(), sniffer);
    }

    // ── Operations ────────────────────────────────────────────────────────────

    /// Binds `address` and its alternates to `handler`.
    ///
    /// Either every address is bound or none is; the error names the address
    /// that failed.
    pub fn bind(
        &self,
        address: ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> BindFuture {
        let uri = address.uri().to_string();
        if self.is_disposed() {
            return OpFuture::ready(Err(BindError::Shutdown { address: uri }));
        }
        let (done, fut) = promise(move || BindError::Cancelled { address: uri });
        let inner = Arc::clone(&self.inner);
        let target = BoundHandler::new(handler, initializer);
        self.inner.boss.spawn(async move {
            done.complete(inner.bind_all(&address, target).await);
        });
        fut
    }

    /// Releases one reference to `address` and its alternates.
    ///
    /// Runs on the serial unbind executor.  After
    /// [`dispose`](Self::dispose) it completes immediately.
    pub fn unbind(&self, address: ResourceAddress) -> UnbindFuture {
        if self.is_disposed() {
            return OpFuture::ready(Ok(()));
        }
        let uri = address.uri().to_string();
        let (done, fut) = promise(move || UnbindError::Cancelled { address: uri });
        let inner = Arc::clone(&self.inner);
        let submitted = self.inner.unbinder.submit(async move {
            done.complete(inner.unbind_all(&address).await);
        });
        match submitted {
            Some(_) => fut,
            None => OpFuture::ready(Ok(())),
        }
    }

    /// Dials `address` from inside a handler callback.
    ///
    /// The new session runs on `cx`'s worker, next to the session that
    /// asked for it.  Prefer this over [`connect`](Self::connect) whenever
    /// a [`WorkerContext`] is at hand.
    pub fn connect_from(
        &self,
        cx: &WorkerContext,
        address: ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        self.connect(address, handler, initializer, Some(cx.worker()))
    }

    /// Dials `address`; the session is delivered to `handler`.
    ///
    /// `affinity: None` places the connection on the least-loaded worker.
    /// Dialling from a handler with `None` therefore loses worker affinity;
    /// use [`connect_from`](Self::connect_from) there.
    pub fn connect(
        &self,
        address: ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
        affinity: Option<WorkerId>,
    ) -> ConnectFuture {
        let uri = address.uri().to_string();
        if self.is_disposed() {
            return OpFuture::ready(Err(ConnectError::Shutdown { address: uri }));
        }
        let (done, fut) = promise(move || ConnectError::Cancelled { address: uri });
        let inner = Arc::clone(&self.inner);
        let target = BoundHandler::new(handler, initializer);
        self.inner.boss.spawn(async move {
            let result = match inner.transport(address.scheme()) {
                Some(transport) => transport.connect(&address, target, affinity).await,
                None => Err(ConnectError::UnsupportedScheme {
                    address: address.uri().to_string(),
                    scheme: address.scheme().to_string(),
                }),
            };
            if let Err(e) = &result {
                debug!(%address, error = %e, "connect failed");
            }
            done.complete(result);
        });
        fut
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    /// The binding owning exactly `address`.
    pub fn lookup(&self, address: &ResourceAddress) -> Option<Binding<BoundHandler>> {
        self.inner.transport(address.scheme())?.lookup(address)
    }

    /// Every binding on `address`'s authority, before dispatch.
    pub fn bindings_at(&self, address: &ResourceAddress) -> Option<NextProtocolBindings<BoundHandler>> {
        self.inner.transport(address.scheme())?.bindings_at(address)
    }

    /// Socket addresses listened on for `address` (its physical address).
    pub fn local_addrs(&self, address: &ResourceAddress) -> Vec<SocketAddr> {
        let physical = address.physical();
        self.inner
            .transport(physical.scheme())
            .map(|t| t.local_addrs(physical))
            .unwrap_or_default()
    }

    /// Physical listeners currently open for `scheme`.
    pub fn listen_count(&self, scheme: &str) -> usize {
        self.inner
            .transport(scheme)
            .map(|t| t.listen_count())
            .unwrap_or(0)
    }

    pub fn pool(&self) -> &Arc<AffinityPool> {
        &self.inner.pool
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Sessions watched by the idle tracker as of its last tick.
    pub fn tracked_sessions(&self) -> usize {
        self.inner.tracker.tracked()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Unbinds everything, closes open sessions and stops every thread.
    ///
    /// Open sessions get up to `shutdown_grace` to deliver `closed`.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("disposing transport service");

        let (layered, physical): (Vec<_>, Vec<_>) = self
            .inner
            .transports
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .partition(|(scheme, _)| !PHYSICAL_SCHEMES.contains(&scheme.as_str()));
        for (_, transport) in layered.into_iter().chain(physical) {
            transport.dispose().await;
        }

        let _ = self.inner.shutdown.send(true);
        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        while self.inner.pool.total_load() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.inner.pool.total_load();
        if remaining > 0 {
            warn!(remaining, "sessions still open after the shutdown grace period");
        }

        self.inner.tracker.stop();
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            inner.unbinder.shutdown();
            inner.pool.shutdown();
        })
        .await;
        if joined.is_err() {
            warn!("shutdown of service threads panicked");
        }
        info!("transport service disposed");
    }
}

impl ServiceInner {
    fn transport(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        let transport = self.transports.get(scheme).map(|t| Arc::clone(t.value()));
        transport
    }

    fn all_addresses(address: &ResourceAddress) -> Vec<ResourceAddress> {
        std::iter::once(address.without_alternates())
            .chain(address.alternates().iter().map(ResourceAddress::without_alternates))
            .collect()
    }

    async fn bind_all(&self, address: &ResourceAddress, target: BoundHandler) -> Result<(), BindError> {
        let mut bound: Vec<(Arc<dyn Transport>, ResourceAddress)> = Vec::new();
        for each in Self::all_addresses(address) {
            let result = match self.transport(each.scheme()) {
                Some(transport) => transport
                    .bind(&each, target.clone())
                    .await
                    .map(|()| transport),
                None => Err(BindError::UnsupportedScheme {
                    address: each.uri().to_string(),
                    scheme: each.scheme().to_string(),
                }),
            };
            match result {
                Ok(transport) => bound.push((transport, each)),
                Err(e) => {
                    warn!(address = %each, error = %e, "bind failed; rolling back");
                    for (transport, done) in bound.into_iter().rev() {
                        let _ = transport.unbind(&done).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn unbind_all(&self, address: &ResourceAddress) -> Result<(), UnbindError> {
        let mut first_error = None;
        for each in Self::all_addresses(address) {
            let result = match self.transport(each.scheme()) {
                Some(transport) => transport.unbind(&each).await,
                None => Err(UnbindError::UnsupportedScheme {
                    address: each.uri().to_string(),
                    scheme: each.scheme().to_string(),
                }),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
