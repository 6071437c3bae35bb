//! Physical transports and the connection driver they share.

pub(crate) mod driver;
pub(crate) mod io;
pub(crate) mod listener;
pub mod pipe;
pub mod tcp;
pub mod udp;

pub use pipe::PipeTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
