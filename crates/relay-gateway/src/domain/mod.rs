//! Configuration schema.

pub mod config;

pub use config::{GatewayConfig, ServiceConfig, ServiceKind, ValidationError};
