//! Config file loading and service wiring.

pub mod config_file;
pub mod wiring;

pub use config_file::{load_config, ConfigError};
pub use wiring::{Gateway, WiringError};
