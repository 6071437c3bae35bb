//! Error taxonomy shared by every layer of the gateway.
//!
//! Each kind of failure has its own enum so callers can match on exactly the
//! cases an operation can produce:
//!
//! | Enum              | Raised by                                   |
//! |-------------------|---------------------------------------------|
//! | [`AddressError`]  | address factory / URI parsing               |
//! | [`BindError`]     | `bind` on any transport                     |
//! | [`UnbindError`]   | `unbind` on any transport                   |
//! | [`ConnectError`]  | `connect` on any transport                  |
//! | [`DispatchError`] | protocol sniffing on a new connection       |
//!
//! Bind errors always name the address (or alternate) that failed, so an
//! operator can tell which of several alternates was the problem.

use std::io;

use thiserror::Error;

/// Failure to build a [`ResourceAddress`](crate::address::ResourceAddress).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing or invalid scheme in {0:?}")]
    MissingScheme(String),

    #[error("missing host in {0:?}")]
    MissingHost(String),

    #[error("missing port in {0:?}")]
    MissingPort(String),

    #[error("invalid port {port:?} in {uri:?}")]
    InvalidPort { uri: String, port: String },

    #[error("malformed address {uri:?}: {reason}")]
    Malformed { uri: String, reason: &'static str },

    #[error("unknown scheme {0:?}")]
    UnknownScheme(String),

    #[error("transport chain for {0:?} is cyclic or too deep")]
    TransportCycle(String),

    #[error("no address given")]
    Empty,
}

/// Failure to bind an address.
#[derive(Debug, Error)]
pub enum BindError {
    /// Another handler already owns this `(address, next protocol)` slot.
    #[error("{address} is already bound to a different handler")]
    Conflict { address: String },

    /// No transport is registered for the address scheme.
    #[error("no transport registered for scheme {scheme:?} (address {address})")]
    UnsupportedScheme { address: String, scheme: String },

    /// Every resolved socket address belongs to an unsupported family.
    #[error("address family not supported for {address}")]
    UnsupportedFamily { address: String },

    /// The host name could not be resolved.
    #[error("could not resolve host for {address}: {source}")]
    UnresolvedHost {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The process may not listen on this address.
    #[error("permission denied binding {address}: {source}")]
    PermissionDenied {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Some other process (or socket) already listens on this address.
    #[error("{address} is already in use: {source}")]
    AddressInUse {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Any other listen failure.
    #[error("listen failed on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The transport was disposed before or during the bind.
    #[error("transport shut down while binding {address}")]
    Shutdown { address: String },

    /// The bind task was dropped before completing.
    #[error("bind of {address} was cancelled")]
    Cancelled { address: String },
}

impl BindError {
    /// Maps a listen-time I/O error to the matching variant.
    pub fn from_listen(address: impl Into<String>, source: io::Error) -> Self {
        let address = address.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { address, source },
            io::ErrorKind::AddrInUse => Self::AddressInUse { address, source },
            _ => Self::Listen { address, source },
        }
    }

    /// The address this error names.
    pub fn address(&self) -> &str {
        match self {
            Self::Conflict { address }
            | Self::UnsupportedScheme { address, .. }
            | Self::UnsupportedFamily { address }
            | Self::UnresolvedHost { address, .. }
            | Self::PermissionDenied { address, .. }
            | Self::AddressInUse { address, .. }
            | Self::Listen { address, .. }
            | Self::Shutdown { address }
            | Self::Cancelled { address } => address,
        }
    }
}

/// Failure to unbind an address.
///
/// Unbinding an address that is not bound is *not* an error.
#[derive(Debug, Error)]
pub enum UnbindError {
    #[error("no transport registered for scheme {scheme:?} (address {address})")]
    UnsupportedScheme { address: String, scheme: String },

    #[error("unbind of {address} was cancelled")]
    Cancelled { address: String },
}

/// Failure to establish an outbound session.
///
/// Connect errors are surfaced without retry; retry policy belongs to the
/// caller.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no transport registered for scheme {scheme:?} (address {address})")]
    UnsupportedScheme { address: String, scheme: String },

    #[error("could not resolve host for {address}: {source}")]
    UnresolvedHost {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("dial to {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Nothing is listening on a pipe / in-process address.
    #[error("connection refused by {address}")]
    Refused { address: String },

    /// The underlying connection closed before the session opened.
    #[error("connection to {address} closed before the session opened")]
    Closed { address: String },

    #[error("transport shut down while connecting to {address}")]
    Shutdown { address: String },

    #[error("connect to {address} was cancelled")]
    Cancelled { address: String },
}

/// Failure to pick a protocol for a new connection from its first bytes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Every candidate rejected the observed bytes.
    #[error("no bound protocol matches the connection (candidates: {candidates:?})")]
    NoMatch { candidates: Vec<String> },

    /// More than `limit` bytes arrived without a decision.
    #[error("protocol still undetermined after {limit} bytes")]
    Overflow { limit: usize },

    /// The peer closed the connection before a decision was possible.
    #[error("connection closed after {received} bytes, before a protocol was determined")]
    Incomplete { received: usize },

    /// No bindings exist at the address (removed concurrently, or never bound).
    #[error("no bindings at {address}")]
    Unbound { address: String },
}
