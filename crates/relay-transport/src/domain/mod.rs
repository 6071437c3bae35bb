//! Session, handler and transport contracts.

pub mod config;
pub mod error;
pub mod handler;
pub mod session;
pub mod transport;

pub use config::TransportConfig;
pub use error::SessionError;
pub use handler::{BoundHandler, IoHandler, IoInterceptor, SessionInitializer};
pub use session::{Session, SessionId, SessionState};
pub use transport::{Transport, TransportContext, TransportTable};
