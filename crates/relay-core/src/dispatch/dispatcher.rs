//! Two-phase protocol dispatcher for a single new connection.
//!
//! # States (for beginners)
//!
//! ```text
//!            feed(chunk)                 decision
//!   ┌──────────────┐  ───────────►  ┌──────────────┐
//!   │   Sniffing   │                │   Resolved   │
//!   │ buffer bytes │  ◄── NeedMore  │ protocol +   │
//!   └──────────────┘                │ replay bytes │
//!          │                        └──────────────┘
//!          └── NoMatch / Overflow / EOF ──► Failed
//! ```
//!
//! While sniffing, every byte received is kept.  When a protocol is chosen
//! the whole buffer is handed back as `replay` so the resolved handler sees
//! the stream from its very first byte.
//!
//! # Decision rule
//!
//! Candidates are ordered by protocol name.  Each sniffed candidate is asked
//! in turn:
//!
//! - `Match` resolves to that candidate;
//! - `NeedMore` stops the scan and waits for more bytes (a later candidate may
//!   not win while an earlier one is undecided);
//! - `NoMatch` moves on to the next candidate.
//!
//! When every sniffed candidate reports `NoMatch`, the first candidate with no
//! sniffer (a "fallback", typically the raw binding with no next protocol)
//! wins.  Otherwise the connection fails with [`DispatchError::NoMatch`].
//!
//! Because each sniffer only ever sees the full prefix received so far, the
//! outcome does not depend on how the bytes were split into chunks.

use std::fmt;
use std::mem;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::sniff::{ProtocolSniffer, SniffResult};
use crate::error::DispatchError;

/// One protocol bound at the address being dispatched.
#[derive(Clone)]
pub struct DispatchCandidate {
    protocol: Option<String>,
    sniffer: Option<Arc<dyn ProtocolSniffer>>,
}

impl DispatchCandidate {
    pub fn sniffed(protocol: Option<String>, sniffer: Arc<dyn ProtocolSniffer>) -> Self {
        Self {
            protocol,
            sniffer: Some(sniffer),
        }
    }

    pub fn fallback(protocol: Option<String>) -> Self {
        Self {
            protocol,
            sniffer: None,
        }
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}

impl fmt::Debug for DispatchCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCandidate")
            .field("protocol", &self.protocol)
            .field("sniffed", &self.sniffer.is_some())
            .finish()
    }
}

/// The protocol chosen for a connection plus the bytes consumed choosing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub protocol: Option<String>,
    pub replay: Bytes,
}

/// Progress report from [`ProtocolDispatcher::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchProgress {
    /// Still undecided; keep reading.
    Pending,
    Resolved(Resolution),
}

enum DispatchState {
    Sniffing { buffer: BytesMut },
    Resolved { protocol: Option<String> },
    Failed(DispatchError),
}

enum Verdict {
    Resolved(usize),
    Wait,
    Exhausted { undecided: bool },
}

/// Resolves the protocol of one connection from its first bytes.
pub struct ProtocolDispatcher {
    candidates: Vec<DispatchCandidate>,
    max_bytes: usize,
    state: DispatchState,
}

impl ProtocolDispatcher {
    /// Creates a dispatcher over `candidates`, giving up after `max_bytes`.
    pub fn new(mut candidates: Vec<DispatchCandidate>, max_bytes: usize) -> Self {
        candidates.sort_by(|a, b| a.protocol.cmp(&b.protocol));
        Self {
            candidates,
            max_bytes: max_bytes.max(1),
            state: DispatchState::Sniffing {
                buffer: BytesMut::new(),
            },
        }
    }

    /// Protocol names in the order they are consulted.
    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|c| c.protocol.clone().unwrap_or_default())
            .collect()
    }

    /// The resolved protocol, once dispatch has completed.
    pub fn resolved(&self) -> Option<Option<&str>> {
        match &self.state {
            DispatchState::Resolved { protocol } => Some(protocol.as_deref()),
            _ => None,
        }
    }

    /// Appends `chunk` and tries to reach a decision.
    ///
    /// After resolution, further chunks pass straight through as `replay`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoMatch`] when every candidate rejects the bytes,
    /// [`DispatchError::Overflow`] when `max_bytes` arrive without a decision.
    /// A failed dispatcher keeps returning the same error.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<DispatchProgress, DispatchError> {
        let buffer = match &mut self.state {
            DispatchState::Sniffing { buffer } => buffer,
            DispatchState::Resolved { protocol } => {
                return Ok(DispatchProgress::Resolved(Resolution {
                    protocol: protocol.clone(),
                    replay: Bytes::copy_from_slice(chunk),
                }))
            }
            DispatchState::Failed(err) => return Err(err.clone()),
        };
        buffer.extend_from_slice(chunk);

        match evaluate(&self.candidates, buffer, false) {
            Verdict::Resolved(index) => Ok(self.resolve(index)),
            Verdict::Wait if buffer.len() >= self.max_bytes => Err(self.fail(DispatchError::Overflow {
                limit: self.max_bytes,
            })),
            Verdict::Wait => Ok(DispatchProgress::Pending),
            Verdict::Exhausted { .. } => {
                let candidates = self.candidate_names();
                Err(self.fail(DispatchError::NoMatch { candidates }))
            }
        }
    }

    /// Signals end of stream.
    ///
    /// Sniffers still asking for more bytes are treated as non-matching, which
    /// may let a later candidate or a fallback win.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Incomplete`] when some candidate was still undecided
    /// and nothing else matched, [`DispatchError::NoMatch`] otherwise.
    pub fn finish(&mut self) -> Result<DispatchProgress, DispatchError> {
        let buffer = match &self.state {
            DispatchState::Sniffing { buffer } => buffer,
            DispatchState::Resolved { protocol } => {
                return Ok(DispatchProgress::Resolved(Resolution {
                    protocol: protocol.clone(),
                    replay: Bytes::new(),
                }))
            }
            DispatchState::Failed(err) => return Err(err.clone()),
        };

        match evaluate(&self.candidates, buffer, true) {
            Verdict::Resolved(index) => Ok(self.resolve(index)),
            Verdict::Exhausted { undecided: true } | Verdict::Wait => {
                let received = buffer.len();
                Err(self.fail(DispatchError::Incomplete { received }))
            }
            Verdict::Exhausted { undecided: false } => {
                let candidates = self.candidate_names();
                Err(self.fail(DispatchError::NoMatch { candidates }))
            }
        }
    }

    fn resolve(&mut self, index: usize) -> DispatchProgress {
        let protocol = self.candidates[index].protocol.clone();
        let previous = mem::replace(
            &mut self.state,
            DispatchState::Resolved {
                protocol: protocol.clone(),
            },
        );
        let replay = match previous {
            DispatchState::Sniffing { buffer } => buffer.freeze(),
            _ => Bytes::new(),
        };
        DispatchProgress::Resolved(Resolution { protocol, replay })
    }

    fn fail(&mut self, err: DispatchError) -> DispatchError {
        self.state = DispatchState::Failed(err.clone());
        err
    }
}

fn evaluate(candidates: &[DispatchCandidate], head: &[u8], eof: bool) -> Verdict {
    let mut undecided = false;
    for (index, candidate) in candidates.iter().enumerate() {
        let Some(sniffer) = &candidate.sniffer else {
            continue;
        };
        match sniffer.sniff(head) {
            SniffResult::Match => return Verdict::Resolved(index),
            SniffResult::NeedMore if !eof => return Verdict::Wait,
            SniffResult::NeedMore => undecided = true,
            SniffResult::NoMatch => {}
        }
    }

    match candidates.iter().position(|c| c.sniffer.is_none()) {
        Some(index) => Verdict::Resolved(index),
        None => Verdict::Exhausted { undecided },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
