//! # relay-core
//!
//! Socket-free building blocks of the relay gateway's binding and layering
//! engine.  Everything here is plain data and pure logic; the async runtime,
//! sockets and worker threads live in `relay-transport`.
//!
//! # Architecture overview (for beginners)
//!
//! A gateway lets one listening port speak several protocols, and lets
//! protocols ride on top of each other (`ws` over `http` over `tcp`).  To
//! make that work, four questions have to be answered for every connection:
//!
//! - **Where is it?**  [`address`] describes endpoints as immutable
//!   [`ResourceAddress`] chains: a layered address carries the address of the
//!   transport beneath it.
//!
//! - **Who handles it?**  [`binding`] keeps the table from addresses to
//!   handlers.  Several protocols may share one physical listener; reference
//!   counts decide when that listener really opens and closes.
//!
//! - **Which protocol is it?**  When more than one protocol is bound at an
//!   address, [`dispatch`] looks at the first bytes of the connection and
//!   picks exactly one, keeping the bytes it looked at for replay.
//!
//! - **Where does it run, and is it idle?**  [`affinity`] balances
//!   connections over worker threads, and [`idle`] decides when a quiet
//!   session deserves an idle notification.
//!
//! Errors for all of the above are collected in [`error`].

pub mod address;
pub mod affinity;
pub mod binding;
pub mod dispatch;
pub mod error;
pub mod idle;

pub use address::{ResourceAddress, ResourceAddressFactory, ResourceOptions};
pub use affinity::{LoadBalancer, WorkerId};
pub use binding::{BindKey, BindTarget, BindingRegistry, NextProtocolBindings};
pub use dispatch::{PrefixSniffer, ProtocolDispatcher, ProtocolSniffer, SniffResult};
pub use error::{AddressError, BindError, ConnectError, DispatchError, UnbindError};
pub use idle::{IdleConfig, IdleEvent, IdleStatus};
