//! # relay-gateway
//!
//! A multi-protocol gateway built on `relay-transport`.  Each configured
//! service is a protocol identified by a byte prefix; several services may
//! share one listening port, and the first bytes of a connection decide
//! which service receives it.
//!
//! # Layers
//!
//! - [`domain`]: the TOML configuration schema and its validation.
//! - [`application`]: what services do with their sessions (echo, relay).
//! - [`infrastructure`]: reading the config file and binding services onto
//!   a [`relay_transport::TransportService`].

pub mod application;
pub mod domain;
pub mod infrastructure;
