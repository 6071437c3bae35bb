//! Idle-timeout policy shared by every session kind.

pub mod policy;

pub use policy::{IdleConfig, IdleEvent, IdleStatus, IdleWindow};
