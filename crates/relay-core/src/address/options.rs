//! Typed option set carried by every [`ResourceAddress`](super::ResourceAddress).
//!
//! Options are fixed at address-creation time.  Only `next_protocol`
//! contributes to address identity; the remaining options tune how the
//! address is bound or how sessions on it are monitored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options that refine how an address is bound, dialled or monitored.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use relay_core::address::ResourceOptions;
///
/// let opts = ResourceOptions::default()
///     .with_next_protocol("alpha")
///     .with_read_idle(Duration::from_secs(30));
/// assert_eq!(opts.next_protocol.as_deref(), Some("alpha"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceOptions {
    /// Name of the protocol layered directly on top of this address.
    ///
    /// Several bindings may share one physical address as long as their
    /// next protocols differ; the dispatcher then picks one per connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_protocol: Option<String>,

    /// Explicit URI of the nested transport, overriding the scheme default
    /// (e.g. run `alpha` over `pipe://alpha-internal` instead of TCP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    /// Local `host:port` to listen on instead of the advertised authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_override: Option<String>,

    /// Read-idle threshold applied to sessions created on this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_idle: Option<Duration>,

    /// Write-idle threshold applied to sessions created on this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_idle: Option<Duration>,

    /// Both-idle threshold applied to sessions created on this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both_idle: Option<Duration>,
}

impl ResourceOptions {
    /// Returns a copy with `next_protocol` set.
    pub fn with_next_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.next_protocol = Some(protocol.into());
        self
    }

    /// Returns a copy with an explicit nested transport URI.
    pub fn with_transport(mut self, uri: impl Into<String>) -> Self {
        self.transport = Some(uri.into());
        self
    }

    /// Returns a copy that listens on `authority` rather than the advertised one.
    pub fn with_bind_override(mut self, authority: impl Into<String>) -> Self {
        self.bind_override = Some(authority.into());
        self
    }

    /// Returns a copy with a read-idle threshold.
    pub fn with_read_idle(mut self, threshold: Duration) -> Self {
        self.read_idle = Some(threshold);
        self
    }

    /// Returns a copy with a write-idle threshold.
    pub fn with_write_idle(mut self, threshold: Duration) -> Self {
        self.write_idle = Some(threshold);
        self
    }

    /// Returns a copy with a both-idle threshold.
    pub fn with_both_idle(mut self, threshold: Duration) -> Self {
        self.both_idle = Some(threshold);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_empty() {
        let opts = ResourceOptions::default();
        assert!(opts.next_protocol.is_none());
        assert!(opts.transport.is_none());
        assert!(opts.bind_override.is_none());
        assert!(opts.read_idle.is_none());
    }

    #[test]
    fn test_builders_set_fields() {
        let opts = ResourceOptions::default()
            .with_transport("pipe://x")
            .with_bind_override("0.0.0.0:9000")
            .with_write_idle(Duration::from_millis(250))
            .with_both_idle(Duration::from_secs(1));
        assert_eq!(opts.transport.as_deref(), Some("pipe://x"));
        assert_eq!(opts.bind_override.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(opts.write_idle, Some(Duration::from_millis(250)));
        assert_eq!(opts.both_idle, Some(Duration::from_secs(1)));
    }
}
