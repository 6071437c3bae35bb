//! Endpoint addresses: the immutable descriptors every bind and connect uses.
//!
//! - [`ResourceAddress`]: scheme, authority, path, options, nested
//!   transport and alternates.
//! - [`ResourceAddressFactory`]: turns URIs into address chains using a
//!   scheme table.
//! - [`ResourceOptions`]: the typed option set.

pub mod factory;
pub mod options;
pub mod resource;
pub mod uri;

pub use factory::{ResourceAddressFactory, SchemeKind, SchemeSpec};
pub use options::ResourceOptions;
pub use resource::ResourceAddress;
