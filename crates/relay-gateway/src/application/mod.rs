//! Connection handlers for the two service kinds.

pub mod echo;
pub mod relay;

pub use echo::EchoHandler;
pub use relay::{Link, RelayHandler};
