//! Protocol layers and the service facade.

pub(crate) mod bridge;
pub mod layer;
pub mod layered;
pub mod service;

pub use layer::{PrefixLayer, ProtocolLayer};
pub use layered::LayeredTransport;
pub use service::TransportService;
