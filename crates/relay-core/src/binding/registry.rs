//! Concurrent address → binding table with reference counting.
//!
//! # Model
//!
//! Bindings are grouped by a [`BindKey`]: the scheme plus the authority an
//! acceptor actually listens on.  Every key owns a [`NextProtocolBindings`]
//! set in which each binding occupies one [`BindingSlot`] (path + next
//! protocol).  One key corresponds to exactly one physical listener, so:
//!
//! - the first binding on a key is the one that must open the listener;
//! - the last binding removed from a key is the one that must close it.
//!
//! Re-binding the same slot with the *same* target bumps that binding's
//! reference count instead of failing.  Binding it with a *different* target
//! is a [`BindError::Conflict`] and leaves the table untouched.
//!
//! # Concurrency
//!
//! The table is a `DashMap`; every mutation of one key happens under that
//! key's shard lock through the entry API, so concurrent binds and unbinds
//! from several accepting threads never observe a half-updated set.

use std::collections::BTreeMap;
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::address::ResourceAddress;
use crate::error::BindError;

/// Something a binding can point at (a handler bundle in practice).
///
/// Targets are compared with [`same_target`](BindTarget::same_target) so
/// that a repeated bind with the same handler counts as a new reference
/// rather than a conflict.
pub trait BindTarget: Clone + Send + Sync {
    fn same_target(&self, other: &Self) -> bool;
}

/// Identifies one physical listener: scheme plus listening authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindKey {
    pub scheme: String,
    pub authority: String,
}

impl BindKey {
    /// The key an address is grouped under.
    pub fn of(address: &ResourceAddress) -> Self {
        Self {
            scheme: address.scheme().to_string(),
            authority: address.bind_authority(),
        }
    }
}

impl fmt::Display for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Position of a binding within its key: path plus next protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingSlot {
    pub path: String,
    pub next_protocol: Option<String>,
}

impl BindingSlot {
    pub fn of(address: &ResourceAddress) -> Self {
        Self {
            path: address.path().to_string(),
            next_protocol: address.next_protocol().map(str::to_string),
        }
    }
}

/// An address bound to a target, with the number of logical binds sharing it.
#[derive(Debug, Clone)]
pub struct Binding<T> {
    address: ResourceAddress,
    target: T,
    ref_count: usize,
}

impl<T> Binding<T> {
    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }
}

/// Every binding registered under one [`BindKey`], ordered by slot.
#[derive(Debug, Clone)]
pub struct NextProtocolBindings<T> {
    slots: BTreeMap<BindingSlot, Binding<T>>,
}

impl<T> Default for NextProtocolBindings<T> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }
}

impl<T> NextProtocolBindings<T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Distinct next-protocol names bound here, in lexical order.
    ///
    /// `None` (no next protocol) sorts first.
    pub fn protocols(&self) -> Vec<Option<String>> {
        let mut protocols: Vec<_> = self
            .slots
            .keys()
            .map(|slot| slot.next_protocol.clone())
            .collect();
        protocols.dedup();
        protocols
    }

    /// `true` when a new connection must be sniffed before delivery.
    pub fn needs_dispatch(&self) -> bool {
        self.protocols().len() > 1
    }

    /// Sum of reference counts: how many logical binds share the listener.
    pub fn reference_count(&self) -> usize {
        self.slots.values().map(|b| b.ref_count).sum()
    }

    /// Bindings whose next protocol is `protocol`, in slot (path) order.
    pub fn for_protocol<'a>(
        &'a self,
        protocol: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Binding<T>> + 'a {
        self.slots
            .iter()
            .filter(move |(slot, _)| slot.next_protocol.as_deref() == protocol)
            .map(|(_, binding)| binding)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding<T>> {
        self.slots.values()
    }
}

/// Result of a successful [`BindingRegistry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    pub key: BindKey,
    /// `true` when this bind created the key: the caller must open the listener.
    pub first_on_key: bool,
    /// Reference count of the slot after this bind.
    pub ref_count: usize,
}

/// Result of [`BindingRegistry::unbind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnbindOutcome {
    /// Nothing was bound at the address; unbind is a no-op.
    NotBound,
    /// A reference was released; `last_on_key` means the listener must close.
    Released {
        key: BindKey,
        remaining_refs: usize,
        last_on_key: bool,
    },
}

/// Thread-safe table of bindings keyed by physical listener.
pub struct BindingRegistry<T> {
    entries: DashMap<BindKey, NextProtocolBindings<T>>,
}

impl<T> Default for BindingRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T: BindTarget> BindingRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `target` at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::Conflict`] when the slot is owned by a different
    /// target.  The table is not modified in that case.
    pub fn bind(&self, address: &ResourceAddress, target: T) -> Result<BindOutcome, BindError> {
        let key = BindKey::of(address);
        let slot = BindingSlot::of(address);

        match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let mut set = NextProtocolBindings::default();
                set.slots.insert(
                    slot,
                    Binding {
                        address: address.clone(),
                        target,
                        ref_count: 1,
                    },
                );
                vacant.insert(set);
                trace!(key = %key, address = %address, "first binding on key");
                Ok(BindOutcome {
                    key,
                    first_on_key: true,
                    ref_count: 1,
                })
            }
            Entry::Occupied(mut occupied) => {
                let set = occupied.get_mut();
                match set.slots.get_mut(&slot) {
                    Some(existing) if existing.address != *address => Err(BindError::Conflict {
                        address: address.to_string(),
                    }),
                    Some(existing) if !existing.target.same_target(&target) => {
                        Err(BindError::Conflict {
                            address: address.to_string(),
                        })
                    }
                    Some(existing) => {
                        existing.ref_count += 1;
                        Ok(BindOutcome {
                            key,
                            first_on_key: false,
                            ref_count: existing.ref_count,
                        })
                    }
                    None => {
                        set.slots.insert(
                            slot,
                            Binding {
                                address: address.clone(),
                                target,
                                ref_count: 1,
                            },
                        );
                        Ok(BindOutcome {
                            key,
                            first_on_key: false,
                            ref_count: 1,
                        })
                    }
                }
            }
        }
    }

    /// Releases one reference on the binding at `address`.
    ///
    /// The slot disappears when its count reaches zero, and the key
    /// disappears when its last slot does.
    pub fn unbind(&self, address: &ResourceAddress) -> UnbindOutcome {
        let key = BindKey::of(address);
        let slot = BindingSlot::of(address);

        let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) else {
            return UnbindOutcome::NotBound;
        };

        let set = occupied.get_mut();
        let remaining_refs = match set.slots.get_mut(&slot) {
            Some(binding) if binding.address == *address => {
                binding.ref_count -= 1;
                binding.ref_count
            }
            _ => return UnbindOutcome::NotBound,
        };

        if remaining_refs == 0 {
            set.slots.remove(&slot);
        }

        let last_on_key = set.slots.is_empty();
        if last_on_key {
            occupied.remove();
            trace!(key = %key, address = %address, "last binding on key released");
        }

        UnbindOutcome::Released {
            key,
            remaining_refs,
            last_on_key,
        }
    }

    /// Removes the binding at `address` entirely, regardless of its count.
    ///
    /// Used to roll back a bind whose listener could not be opened.
    pub fn remove(&self, address: &ResourceAddress) -> UnbindOutcome {
        loop {
            match self.unbind(address) {
                UnbindOutcome::Released {
                    remaining_refs: 0,
                    key,
                    last_on_key,
                } => {
                    return UnbindOutcome::Released {
                        key,
                        remaining_refs: 0,
                        last_on_key,
                    }
                }
                UnbindOutcome::Released { .. } => continue,
                UnbindOutcome::NotBound => return UnbindOutcome::NotBound,
            }
        }
    }

    /// The binding registered exactly at `address`.
    pub fn lookup(&self, address: &ResourceAddress) -> Option<Binding<T>> {
        let key = BindKey::of(address);
        let slot = BindingSlot::of(address);
        self.entries
            .get(&key)
            .and_then(|set| set.slots.get(&slot).cloned())
            .filter(|binding| binding.address == *address)
    }

    /// Snapshot of the binding set at `key`, for pre-dispatch decisions.
    pub fn bindings_at(&self, key: &BindKey) -> Option<NextProtocolBindings<T>> {
        self.entries.get(key).map(|set| set.clone())
    }

    /// `true` while at least one binding exists at `key`.
    pub fn is_bound(&self, key: &BindKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Every key currently bound, sorted.
    pub fn keys(&self) -> Vec<BindKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Every binding in the table, sorted by address.
    pub fn snapshot(&self) -> Vec<Binding<T>> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .flat_map(|e| e.value().slots.values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    /// Drops every binding and returns the keys that were bound.
    pub fn clear(&self) -> Vec<BindKey> {
        let keys = self.keys();
        self.entries.clear();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
