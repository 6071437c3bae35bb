//! Protocol sniffing for connections accepted on a shared address.

pub mod dispatcher;
pub mod sniff;

pub use dispatcher::{DispatchCandidate, DispatchProgress, ProtocolDispatcher, Resolution};
pub use sniff::{PrefixSniffer, ProtocolSniffer, SniffResult};
