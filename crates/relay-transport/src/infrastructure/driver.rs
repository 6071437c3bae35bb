//! Per-connection driver: dispatch, session lifecycle, read and write loops.
//!
//! Every physical connection, whatever its transport, goes through the same
//! steps on its worker:
//!
//! 1. **Dispatch** (accepted connections only).  When several protocols
//!    share the listener, the first bytes are fed to a
//!    [`ProtocolDispatcher`] until exactly one protocol is chosen.  Nothing
//!    is delivered to any handler before that.
//! 2. **Binding lookup.**  The binding for the chosen protocol is looked up
//!    again; if it was unbound in the meantime the connection is dropped
//!    without a single event.
//! 3. **Open.**  The session is created, the initializer runs, `created` and
//!    `opened` fire, and the bytes consumed while sniffing are replayed as
//!    the first `message_received`.
//! 4. **Serve.**  A read loop delivers chunks; a separate writer task drains
//!    the session's outbound queue in order.
//! 5. **Close.**  When the peer leaves, the writer stops or the service
//!    shuts down, queued writes are flushed (bounded by `shutdown_grace`) and
//!    `closed` fires exactly once.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use relay_core::address::ResourceAddress;
use relay_core::binding::{BindKey, Binding};
use relay_core::dispatch::{DispatchProgress, ProtocolDispatcher, Resolution};
use relay_core::error::{ConnectError, DispatchError};
use relay_core::idle::IdleConfig;

use super::io::{Inbound, Outbound};
use crate::domain::error::SessionError;
use crate::domain::handler::BoundHandler;
use crate::domain::session::{OutboundCommand, Session};
use crate::domain::transport::{HandlerRegistry, TransportContext};
use crate::runtime::future::Promise;
use crate::runtime::pool::WorkerLease;
use crate::runtime::worker::WorkerContext;

/// Where an accepted connection came in.
pub(crate) struct AcceptContext {
    pub registry: Arc<HandlerRegistry>,
    pub key: BindKey,
    pub transport: TransportContext,
}

/// The two halves of a physical connection plus the peer's address.
pub(crate) struct Connection {
    pub remote: ResourceAddress,
    pub inbound: Box<dyn Inbound>,
    pub outbound: Box<dyn Outbound>,
}

#[derive(Debug, Error)]
enum AcceptFailure {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("read failed during dispatch: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves one accepted connection until it closes.
pub(crate) async fn serve_accepted(
    cx: WorkerContext,
    lease: WorkerLease,
    accept: AcceptContext,
    connection: Connection,
) {
    let AcceptContext {
        registry,
        key,
        transport,
    } = accept;
    let Connection {
        remote,
        mut inbound,
        mut outbound,
    } = connection;

    let Some(bindings) = registry.bindings_at(&key) else {
        debug!(%key, %remote, "no bindings left; connection dropped");
        let _ = outbound.shutdown().await;
        return;
    };

    let (protocol, replay) = if bindings.needs_dispatch() {
        let candidates = transport.candidates(&bindings.protocols());
        let mut dispatcher = ProtocolDispatcher::new(candidates, transport.config.max_sniff_bytes);
        let mut shutdown = transport.shutdown.clone();
        match sniff(&mut dispatcher, inbound.as_mut(), &mut shutdown).await {
            Ok(Some(resolution)) => {
                debug!(%key, %remote, protocol = ?resolution.protocol, "protocol resolved");
                (resolution.protocol, resolution.replay)
            }
            Ok(None) => {
                let _ = outbound.shutdown().await;
                return;
            }
            Err(e) => {
                warn!(%key, %remote, error = %e, "protocol dispatch failed; closing connection");
                let _ = outbound.shutdown().await;
                return;
            }
        }
    } else {
        (bindings.protocols().into_iter().next().flatten(), Bytes::new())
    };

    let Some(binding) = binding_for(&registry, &key, protocol.as_deref()) else {
        debug!(%key, %remote, protocol = ?protocol, "binding removed before open; connection dropped");
        let _ = outbound.shutdown().await;
        return;
    };

    let target = binding.target().clone();
    let idle = IdleConfig::from_options(binding.address().options()).or(transport.config.default_idle());
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::physical(
        lease,
        binding.address().clone(),
        remote,
        Arc::clone(target.handler()),
        tx,
        idle,
    );
    run_session(&cx, session, &target, &transport, inbound, outbound, rx, replay, None).await;
}

/// Serves one dialled connection until it closes; `opened` completes the
/// caller's connect once the session is open.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_connected(
    cx: WorkerContext,
    lease: WorkerLease,
    local: ResourceAddress,
    target: BoundHandler,
    transport: TransportContext,
    connection: Connection,
    idle: IdleConfig,
    opened: Promise<Result<Session, ConnectError>>,
) {
    let Connection {
        remote,
        inbound,
        outbound,
    } = connection;
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::physical(
        lease,
        local,
        remote,
        Arc::clone(target.handler()),
        tx,
        idle.or(transport.config.default_idle()),
    );
    run_session(
        &cx,
        session,
        &target,
        &transport,
        inbound,
        outbound,
        rx,
        Bytes::new(),
        Some(opened),
    )
    .await;
}

fn binding_for(
    registry: &HandlerRegistry,
    key: &BindKey,
    protocol: Option<&str>,
) -> Option<Binding<BoundHandler>> {
    let bindings = registry.bindings_at(key)?;
    let found = bindings.for_protocol(protocol).next().cloned();
    found
}

async fn sniff(
    dispatcher: &mut ProtocolDispatcher,
    inbound: &mut dyn Inbound,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Resolution>, AcceptFailure> {
    loop {
        let progress = tokio::select! {
            chunk = inbound.recv() => match chunk? {
                Some(data) => dispatcher.feed(&data)?,
                None => dispatcher.finish()?,
            },
            _ = shutdown.changed() => return Ok(None),
        };
        if let DispatchProgress::Resolved(resolution) = progress {
            return Ok(Some(resolution));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    cx: &WorkerContext,
    session: Session,
    target: &BoundHandler,
    transport: &TransportContext,
    mut inbound: Box<dyn Inbound>,
    outbound: Box<dyn Outbound>,
    rx: mpsc::UnboundedReceiver<OutboundCommand>,
    replay: Bytes,
    opened: Option<Promise<Result<Session, ConnectError>>>,
) {
    let mut writer = cx.spawn_local(write_loop(cx.clone(), outbound, rx));

    if let Some(initializer) = target.initializer() {
        session.initialize(cx, initializer);
    }
    session.fire_created(cx);
    session.fire_opened(cx);
    if let Some(opened) = opened {
        opened.complete(Ok(session.clone()));
    }
    transport.tracker.add(&session);
    if !replay.is_empty() {
        session.deliver_received(cx, replay);
    }

    let mut shutdown = transport.shutdown.clone();
    let mut writer_done = false;
    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                chunk = inbound.recv() => match chunk {
                    Ok(Some(data)) => session.deliver_received(cx, data),
                    Ok(None) => {
                        debug!(session = %session.id(), "peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        session.raise(cx, SessionError::io(e));
                        break;
                    }
                },
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
    drop(inbound);

    if !writer_done {
        session.shutdown_writer();
        let grace = transport.config.shutdown_grace;
        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            warn!(session = %session.id(), "writer did not drain in time; aborting");
            writer.abort();
        }
    }

    session.fire_closed(cx);
    transport.tracker.remove(session.id());
}

async fn write_loop(
    cx: WorkerContext,
    mut outbound: Box<dyn Outbound>,
    mut rx: mpsc::UnboundedReceiver<OutboundCommand>,
) {
    while let Some(command) = rx.recv().await {
        let write = match command {
            OutboundCommand::Write(write) => write,
            OutboundCommand::Close => break,
        };
        match outbound.send(&write.data).await {
            Ok(()) => {
                write.origin.record_write(write.data.len(), Instant::now());
                write.promise.complete(Ok(()));
                write.origin.fire_message_sent(&cx, &write.origin_data);
            }
            Err(e) => {
                let error = SessionError::io(e);
                write.promise.complete(Err(error.clone()));
                write.origin.raise(&cx, error);
                break;
            }
        }
    }
    let _ = outbound.shutdown().await;

    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let OutboundCommand::Write(write) = command {
            let id = write.origin.id();
            write.promise.complete(Err(SessionError::Closed(id)));
        }
    }
}
