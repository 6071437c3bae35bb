//! # relay-transport
//!
//! Sockets, worker threads and sessions for the relay gateway.
//!
//! # Architecture overview (for beginners)
//!
//! ```text
//!  ┌──────────────────────── TransportService ────────────────────────┐
//!  │  bind / unbind / connect        address factory    sniffers      │
//!  │        │                                                         │
//!  │        ▼  by scheme                                              │
//!  │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────────┐  │
//!  │  │ TcpTrans. │  │ UdpTrans. │  │ PipeTrans.│  │ LayeredTrans. │  │
//!  │  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  └──────┬────────┘  │
//!  │        └───── accept / dial ─────────┘               │ binds the │
//!  │                    │                                  │ nested   │
//!  │                    ▼                                  │ address  │
//!  │        driver: dispatch → Session → events ◀──────────┘          │
//!  └────────────────────┬─────────────────────────────────────────────┘
//!                       ▼
//!        AffinityPool: N single-threaded workers, one per session
//! ```
//!
//! - [`domain`] holds the contracts: [`Session`], [`IoHandler`],
//!   [`Transport`] and [`TransportConfig`].
//! - [`runtime`] holds the threads: the [`AffinityPool`] of workers, the
//!   shared [`IdleTracker`], the serial unbind executor and the
//!   [`OpFuture`] handles every operation returns.
//! - [`infrastructure`] holds the physical transports (`tcp`, `udp`,
//!   `pipe`) and the connection driver they share.
//! - [`application`] holds protocol layers and the [`TransportService`]
//!   facade.
//!
//! # Thread affinity
//!
//! Each session lives on exactly one worker from its first event to its
//! last.  Every handler callback for it runs there, and `write`/`close`
//! must be called from there too (the [`WorkerContext`] passed to every
//! callback proves it).  Bridge sessions share their parent's worker, and
//! outbound connections can ask for the caller's worker as their affinity.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod runtime;

pub use application::{LayeredTransport, PrefixLayer, ProtocolLayer, TransportService};
pub use domain::{
    BoundHandler, IoHandler, IoInterceptor, Session, SessionError, SessionId, SessionInitializer,
    SessionState, Transport, TransportConfig,
};
pub use infrastructure::{PipeTransport, TcpTransport, UdpTransport};
pub use runtime::{
    AffinityPool, BindFuture, CloseFuture, ConnectFuture, IdleTracker, OpFuture, UnbindFuture,
    WorkerContext, WorkerHandle, WriteFuture,
};

pub use relay_core::{
    AddressError, BindError, ConnectError, IdleEvent, IdleStatus, ResourceAddress, ResourceOptions,
    UnbindError, WorkerId,
};
