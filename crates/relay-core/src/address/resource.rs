//! The immutable endpoint descriptor used for every bind and connect.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::options::ResourceOptions;
use super::uri::format_host;

/// An immutable, comparable descriptor of a bindable or dialable location.
///
/// A `ResourceAddress` names a scheme (`tcp`, `udp`, `pipe`, or a layered
/// protocol such as `ws`), an authority, a path and a typed option set.
/// Layered addresses carry the address of the transport they ride on, so
/// `alpha://host:9000` over `tcp://host:9000` is a two-level chain.
///
/// # Identity
///
/// Two addresses are equal when their canonical URI, their `next_protocol`
/// option and their nested transport are all equal.  The same URI over two
/// different transports are therefore two different addresses.  Alternates
/// and tuning options (idle thresholds, bind overrides) do not participate.
///
/// # Ordering
///
/// Addresses order by canonical URI first, which gives deterministic
/// iteration over bound authorities.
#[derive(Debug, Clone)]
pub struct ResourceAddress {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    uri: String,
    options: ResourceOptions,
    transport: Option<Box<ResourceAddress>>,
    alternates: Vec<ResourceAddress>,
}

impl ResourceAddress {
    /// Creates an address with no options, transport or alternates.
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
        path: impl Into<String>,
    ) -> Self {
        let scheme = scheme.into().to_ascii_lowercase();
        let host = host.into();
        let path = path.into();
        let uri = match port {
            Some(p) => format!("{scheme}://{}:{p}{path}", format_host(&host)),
            None => format!("{scheme}://{}{path}", format_host(&host)),
        };
        Self {
            scheme,
            host,
            port,
            path,
            uri,
            options: ResourceOptions::default(),
            transport: None,
            alternates: Vec::new(),
        }
    }

    /// Returns a copy carrying `options`.
    pub fn with_options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns a copy layered over `transport`.
    pub fn with_transport(mut self, transport: ResourceAddress) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Returns a copy carrying `alternates`, bound and unbound together with it.
    pub fn with_alternates(mut self, alternates: Vec<ResourceAddress>) -> Self {
        self.alternates = alternates;
        self
    }

    /// Returns a copy with no alternates.
    pub fn without_alternates(&self) -> Self {
        let mut copy = self.clone();
        copy.alternates.clear();
        copy
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Canonical URI (`scheme://host:port/path`).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> &ResourceOptions {
        &self.options
    }

    pub fn next_protocol(&self) -> Option<&str> {
        self.options.next_protocol.as_deref()
    }

    /// The nested transport, if this is a layered address.
    pub fn transport(&self) -> Option<&ResourceAddress> {
        self.transport.as_deref()
    }

    pub fn alternates(&self) -> &[ResourceAddress] {
        &self.alternates
    }

    /// `true` when this address rides on another address.
    pub fn is_layered(&self) -> bool {
        self.transport.is_some()
    }

    /// `host[:port]`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{p}", format_host(&self.host)),
            None => format_host(&self.host),
        }
    }

    /// The authority a physical acceptor should listen on.
    ///
    /// Honours [`ResourceOptions::bind_override`] when present.
    pub fn bind_authority(&self) -> String {
        self.options
            .bind_override
            .clone()
            .unwrap_or_else(|| self.authority())
    }

    /// Walks the transport chain down to the physical address.
    pub fn physical(&self) -> &ResourceAddress {
        let mut current = self;
        while let Some(next) = current.transport() {
            current = next;
        }
        current
    }

    /// Number of layers above the physical address (0 for `tcp://...`).
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(next) = current.transport() {
            depth += 1;
            current = next;
        }
        depth
    }

    fn identity(&self) -> (&str, Option<&str>, Option<&ResourceAddress>) {
        (self.uri.as_str(), self.next_protocol(), self.transport())
    }
}

impl PartialEq for ResourceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ResourceAddress {}

impl Hash for ResourceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for ResourceAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)?;
        if let Some(proto) = self.next_protocol() {
            write!(f, " [{proto}]")?;
        }
        if let Some(transport) = self.transport() {
            write!(f, " over {transport}")?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};
    use std::time::Duration;

    fn tcp(port: u16) -> ResourceAddress {
        ResourceAddress::new("tcp", "127.0.0.1", Some(port), "")
    }

    #[test]
    fn test_uri_is_canonical() {
        let addr = ResourceAddress::new("WS", "::1", Some(80), "/chat");
        assert_eq!(addr.uri(), "ws://[::1]:80/chat");
        assert_eq!(addr.authority(), "[::1]:80");
    }

    #[test]
    fn test_equal_uri_different_transport_is_distinct() {
        // Arrange
        let a = ResourceAddress::new("alpha", "h", Some(1), "").with_transport(tcp(1));
        let b = ResourceAddress::new("alpha", "h", Some(1), "").with_transport(
            ResourceAddress::new("pipe", "alpha", None, ""),
        );

        // Assert
        assert_ne!(a, b);
        let set: HashSet<_> = [a.clone(), b.clone(), a.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_next_protocol_participates_in_identity() {
        let a = tcp(9000).with_options(ResourceOptions::default().with_next_protocol("alpha"));
        let b = tcp(9000).with_options(ResourceOptions::default().with_next_protocol("beta"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_tuning_options_do_not_participate_in_identity() {
        let a = tcp(9000);
        let b = tcp(9000).with_options(
            ResourceOptions::default().with_read_idle(Duration::from_secs(5)),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_alternates_do_not_participate_in_identity() {
        let a = tcp(9000).with_alternates(vec![tcp(9001)]);
        assert_eq!(a, tcp(9000));
        assert!(a.without_alternates().alternates().is_empty());
    }

    #[test]
    fn test_ordering_is_by_uri() {
        let set: BTreeSet<_> = [tcp(9002), tcp(9000), tcp(9001)].into_iter().collect();
        let ports: Vec<_> = set.iter().map(|a| a.port().unwrap()).collect();
        assert_eq!(ports, vec![9000, 9001, 9002]);
    }

    #[test]
    fn test_physical_walks_transport_chain() {
        let ws = ResourceAddress::new("ws", "h", Some(80), "/x").with_transport(
            ResourceAddress::new("http", "h", Some(80), "/x").with_transport(tcp(80)),
        );
        assert_eq!(ws.physical(), &tcp(80));
        assert_eq!(ws.depth(), 2);
        assert!(ws.is_layered());
    }

    #[test]
    fn test_bind_authority_prefers_override() {
        let addr = tcp(9000)
            .with_options(ResourceOptions::default().with_bind_override("0.0.0.0:9100"));
        assert_eq!(addr.bind_authority(), "0.0.0.0:9100");
        assert_eq!(tcp(9000).bind_authority(), "127.0.0.1:9000");
    }

    #[test]
    fn test_display_mentions_protocol_and_transport() {
        let addr = ResourceAddress::new("alpha", "h", Some(1), "").with_transport(
            tcp(1).with_options(ResourceOptions::default().with_next_protocol("alpha")),
        );
        assert_eq!(
            addr.to_string(),
            "alpha://h:1 over tcp://127.0.0.1:1 [alpha]"
        );
    }
}
