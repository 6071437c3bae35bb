//! Protocol layers: schemes that ride on another transport.

use std::sync::Arc;

use bytes::Bytes;

use relay_core::address::ResourceAddress;
use relay_core::dispatch::{PrefixSniffer, ProtocolSniffer};

use crate::domain::session::Session;

/// Describes an upper protocol to the transport service.
///
/// Registering a layer makes its scheme bindable and dialable: binding
/// `alpha://host:9000` binds `tcp://host:9000` with next protocol `alpha`,
/// and every connection dispatched to `alpha` gets a bridge session.
pub trait ProtocolLayer: Send + Sync + 'static {
    /// Scheme of the layer (`alpha`).
    fn scheme(&self) -> &str;

    /// Scheme it rides on by default (`tcp`).
    fn transport_scheme(&self) -> &str;

    fn default_port(&self) -> Option<u16> {
        None
    }

    /// Recognises this layer's connections when several share a listener.
    fn sniffer(&self) -> Option<Arc<dyn ProtocolSniffer>> {
        None
    }

    /// Chooses which bound address a newly opened parent connection serves.
    ///
    /// `candidates` are the layer addresses bound over the parent's address,
    /// sorted.  Returning `None` closes the parent.
    fn route(&self, _parent: &Session, candidates: &[ResourceAddress]) -> Option<ResourceAddress> {
        candidates.first().cloned()
    }
}

/// A layer recognised by a fixed byte prefix.
#[derive(Debug, Clone)]
pub struct PrefixLayer {
    scheme: String,
    transport_scheme: String,
    prefix: Bytes,
    default_port: Option<u16>,
}

impl PrefixLayer {
    pub fn new(
        scheme: impl Into<String>,
        transport_scheme: impl Into<String>,
        prefix: impl Into<Bytes>,
    ) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            transport_scheme: transport_scheme.into().to_ascii_lowercase(),
            prefix: prefix.into(),
            default_port: None,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl ProtocolLayer for PrefixLayer {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn transport_scheme(&self) -> &str {
        &self.transport_scheme
    }

    fn default_port(&self) -> Option<u16> {
        self.default_port
    }

    fn sniffer(&self) -> Option<Arc<dyn ProtocolSniffer>> {
        if self.prefix.is_empty() {
            return None;
        }
        Some(Arc::new(PrefixSniffer::new(self.prefix.clone())))
    }
}
