//! Gateway configuration schema.
//!
//! The gateway reads one TOML file at startup:
//!
//! ```toml
//! [gateway]
//! log_level = "info"
//! workers = 4
//!
//! [transport]
//! idle_tick_ms = 100
//! read_idle_ms = 30000
//!
//! [[service]]
//! name = "echo"
//! accept = ["echo://0.0.0.0:7000"]
//! protocol = "echo"
//! sniff_prefix = "ECHO"
//! kind = "echo"
//!
//! [[service]]
//! name = "backend-relay"
//! accept = ["relay://0.0.0.0:7000"]
//! protocol = "relay"
//! sniff_prefix = "RLAY"
//! kind = "relay"
//! connect = "tcp://10.0.0.5:9000"
//! ```
//!
//! Both services above share port 7000: the first bytes of each connection
//! (`ECHO...` or `RLAY...`) decide which one it reaches.
//!
//! # Serde default values
//!
//! Every field has a `#[serde(default = ...)]`, so an empty file (or none
//! at all) yields a gateway with default tuning and no services.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_transport::TransportConfig;

/// Semantic problems in an otherwise well-formed configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("service #{index} has no name")]
    MissingName { index: usize },

    #[error("service name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("service '{0}' has no accept address")]
    NoAcceptAddress(String),

    #[error("service '{0}' has no protocol name")]
    MissingProtocol(String),

    #[error("relay service '{0}' needs a connect address")]
    MissingConnect(String),

    #[error("gateway.workers must be at least 1")]
    ZeroWorkers,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// I/O worker threads.  Absent means one per CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// Transport tuning, mapped onto [`TransportConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_idle_tick_ms")]
    pub idle_tick_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_sniff_bytes")]
    pub max_sniff_bytes: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_idle_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_idle_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both_idle_ms: Option<u64>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// What a service does with the connections it accepts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Writes every received byte back.
    #[default]
    Echo,
    /// Dials `connect` on the same worker and pipes bytes both ways.
    Relay,
}

/// One `[[service]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    /// Addresses to accept on; the first is primary, the rest are bound with
    /// it as alternates.
    #[serde(default)]
    pub accept: Vec<String>,
    /// Protocol layer name; also the URI scheme of the accept addresses.
    #[serde(default)]
    pub protocol: String,
    /// Leading bytes identifying the protocol on a shared port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniff_prefix: Option<String>,
    /// Scheme the protocol rides on.
    #[serde(default = "default_transport_scheme")]
    pub transport: String,
    #[serde(default)]
    pub kind: ServiceKind,
    /// Backend dialled by relay services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_idle_tick_ms() -> u64 {
    100
}
fn default_read_buffer_size() -> usize {
    8 * 1024
}
fn default_max_sniff_bytes() -> usize {
    4 * 1024
}
fn default_listen_backlog() -> u32 {
    1024
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_transport_scheme() -> String {
    "tcp".to_string()
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workers: None,
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            idle_tick_ms: default_idle_tick_ms(),
            read_buffer_size: default_read_buffer_size(),
            max_sniff_bytes: default_max_sniff_bytes(),
            listen_backlog: default_listen_backlog(),
            read_idle_ms: None,
            write_idle_ms: None,
            both_idle_ms: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl GatewayConfig {
    /// Checks what serde cannot: names, required fields per kind, counts.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.gateway.workers == Some(0) {
            return Err(ValidationError::ZeroWorkers);
        }
        let mut names = HashSet::new();
        for (index, service) in self.services.iter().enumerate() {
            if service.name.is_empty() {
                return Err(ValidationError::MissingName { index });
            }
            if !names.insert(service.name.as_str()) {
                return Err(ValidationError::DuplicateName(service.name.clone()));
            }
            if service.accept.is_empty() {
                return Err(ValidationError::NoAcceptAddress(service.name.clone()));
            }
            if service.protocol.is_empty() {
                return Err(ValidationError::MissingProtocol(service.name.clone()));
            }
            if service.kind == ServiceKind::Relay && service.connect.is_none() {
                return Err(ValidationError::MissingConnect(service.name.clone()));
            }
        }
        Ok(())
    }

    /// Transport settings, with `workers` overriding the file when given.
    pub fn transport_config(&self, workers: Option<usize>) -> TransportConfig {
        let t = &self.transport;
        let defaults = TransportConfig::default();
        TransportConfig {
            worker_count: workers
                .or(self.gateway.workers)
                .unwrap_or(defaults.worker_count)
                .max(1),
            idle_tick: Duration::from_millis(t.idle_tick_ms.max(1)),
            read_buffer_size: t.read_buffer_size.max(1),
            max_sniff_bytes: t.max_sniff_bytes.max(1),
            listen_backlog: t.listen_backlog,
            default_read_idle: t.read_idle_ms.map(Duration::from_millis),
            default_write_idle: t.write_idle_ms.map(Duration::from_millis),
            default_both_idle: t.both_idle_ms.map(Duration::from_millis),
            shutdown_grace: Duration::from_millis(t.shutdown_grace_ms),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
