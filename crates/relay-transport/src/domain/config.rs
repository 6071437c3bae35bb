//! Tuning knobs for the transport layer.
//!
//! Values are read once at startup (the gateway fills them from its TOML
//! file) and shared read-only by every transport afterwards.

use std::time::Duration;

use relay_core::idle::IdleConfig;

/// Runtime configuration for a [`TransportService`](crate::TransportService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Number of I/O worker threads.
    pub worker_count: usize,

    /// Period of the shared idle check.  Idle notifications are accurate to
    /// roughly one tick.
    pub idle_tick: Duration,

    /// Maximum bytes read from a connection in one go.
    pub read_buffer_size: usize,

    /// Bytes a connection may send before its protocol must be known.
    pub max_sniff_bytes: usize,

    /// Backlog passed to `listen(2)`.
    pub listen_backlog: u32,

    /// Read-idle threshold for sessions whose address sets none.
    pub default_read_idle: Option<Duration>,

    /// Write-idle threshold for sessions whose address sets none.
    pub default_write_idle: Option<Duration>,

    /// Both-idle threshold for sessions whose address sets none.
    pub default_both_idle: Option<Duration>,

    /// How long `dispose` waits for open sessions to deliver `closed`.
    pub shutdown_grace: Duration,
}

impl TransportConfig {
    /// Idle thresholds applied when an address sets none.
    pub fn default_idle(&self) -> IdleConfig {
        IdleConfig {
            read: self.default_read_idle,
            write: self.default_write_idle,
            both: self.default_both_idle,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            idle_tick: Duration::from_millis(100),
            read_buffer_size: 8 * 1024,
            max_sniff_bytes: 4 * 1024,
            listen_backlog: 1024,
            default_read_idle: None,
            default_write_idle: None,
            default_both_idle: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// One worker per available CPU, at least one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TransportConfig::default();
        assert!(config.worker_count >= 1);
        assert_eq!(config.idle_tick, Duration::from_millis(100));
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.max_sniff_bytes, 4096);
        assert_eq!(config.listen_backlog, 1024);
        assert!(!config.default_idle().is_enabled());
    }

    #[test]
    fn test_default_idle_collects_thresholds() {
        let config = TransportConfig {
            default_write_idle: Some(Duration::from_secs(4)),
            ..TransportConfig::default()
        };
        assert_eq!(config.default_idle().write, Some(Duration::from_secs(4)));
    }
}
