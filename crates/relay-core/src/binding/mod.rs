//! Binding table: which handler owns which `(address, next protocol)` slot.

pub mod registry;

pub use registry::{
    BindKey, BindOutcome, BindTarget, Binding, BindingRegistry, BindingSlot,
    NextProtocolBindings, UnbindOutcome,
};
