//! Per-protocol sniff predicates.

use bytes::Bytes;

/// Verdict of one sniffer on the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffResult {
    /// The bytes belong to this protocol.
    Match,
    /// The bytes cannot belong to this protocol.
    NoMatch,
    /// Not enough bytes to decide yet.
    NeedMore,
}

/// Decides whether the first bytes of a connection belong to one protocol.
///
/// Implementations must be pure functions of `head`: the dispatcher calls
/// them again with a longer prefix every time more bytes arrive, and relies
/// on the verdict being independent of how the bytes were fragmented.
#[cfg_attr(test, mockall::automock)]
pub trait ProtocolSniffer: Send + Sync {
    fn sniff(&self, head: &[u8]) -> SniffResult;
}

/// Matches connections whose first bytes equal a fixed prefix.
#[derive(Debug, Clone)]
pub struct PrefixSniffer {
    prefix: Bytes,
}

impl PrefixSniffer {
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl ProtocolSniffer for PrefixSniffer {
    fn sniff(&self, head: &[u8]) -> SniffResult {
        if head.len() >= self.prefix.len() {
            if head.starts_with(&self.prefix) {
                SniffResult::Match
            } else {
                SniffResult::NoMatch
            }
        } else if self.prefix.starts_with(head) {
            SniffResult::NeedMore
        } else {
            SniffResult::NoMatch
        }
    }
}
