//! Creates [`ResourceAddress`] chains from URIs.
//!
//! The factory knows, per scheme, whether the scheme is physical (`tcp`,
//! `udp`, `pipe`) or layered over another scheme.  For a layered scheme it
//! derives the nested transport address automatically:
//!
//! ```text
//! alpha://gw.example:9000        (options.next_protocol = none)
//!   └─ tcp://gw.example:9000     (options.next_protocol = "alpha")
//! ```
//!
//! The derived transport inherits the authority of the layered address and
//! has its `next_protocol` set to the layered scheme, which is what lets
//! several protocols share one physical listener.

use std::collections::HashMap;

use super::options::ResourceOptions;
use super::resource::ResourceAddress;
use super::uri::split_uri;
use crate::error::AddressError;

/// How a scheme relates to the transport below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeKind {
    /// Owns sockets directly.
    Physical,
    /// Rides on another scheme (e.g. `ws` over `tcp`).
    Layered { transport: String },
}

/// Registration record for one scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeSpec {
    pub kind: SchemeKind,
    /// Port used when the URI omits one.
    pub default_port: Option<u16>,
    /// Whether the scheme addresses need a port at all (`pipe` does not).
    pub requires_port: bool,
}

impl SchemeSpec {
    pub fn physical(requires_port: bool) -> Self {
        Self {
            kind: SchemeKind::Physical,
            default_port: None,
            requires_port,
        }
    }

    pub fn layered(transport: impl Into<String>, default_port: Option<u16>) -> Self {
        Self {
            kind: SchemeKind::Layered {
                transport: transport.into(),
            },
            default_port,
            requires_port: false,
        }
    }
}

/// Builds address chains from URIs according to a scheme table.
#[derive(Debug, Clone)]
pub struct ResourceAddressFactory {
    schemes: HashMap<String, SchemeSpec>,
}

impl Default for ResourceAddressFactory {
    /// A factory that knows the three physical schemes.
    fn default() -> Self {
        let mut schemes = HashMap::new();
        schemes.insert("tcp".to_string(), SchemeSpec::physical(true));
        schemes.insert("udp".to_string(), SchemeSpec::physical(true));
        schemes.insert("pipe".to_string(), SchemeSpec::physical(false));
        Self { schemes }
    }
}

impl ResourceAddressFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a scheme.
    pub fn register(&mut self, scheme: impl Into<String>, spec: SchemeSpec) {
        self.schemes.insert(scheme.into().to_ascii_lowercase(), spec);
    }

    /// Registers a layered scheme riding on `transport`.
    pub fn register_layer(
        &mut self,
        scheme: impl Into<String>,
        transport: impl Into<String>,
        default_port: Option<u16>,
    ) {
        self.register(scheme, SchemeSpec::layered(transport, default_port));
    }

    pub fn scheme(&self, scheme: &str) -> Option<&SchemeSpec> {
        self.schemes.get(scheme)
    }

    /// Creates an address with default options.
    ///
    /// # Errors
    ///
    /// See [`new_address_with`](Self::new_address_with).
    pub fn new_address(&self, uri: &str) -> Result<ResourceAddress, AddressError> {
        self.new_address_with(uri, ResourceOptions::default())
    }

    /// Creates an address chain for `uri` carrying `options`.
    ///
    /// Layered schemes get a nested transport address: either the URI given in
    /// `options.transport`, or one derived from the scheme table using the
    /// same authority.  The nested address always has `next_protocol` set to
    /// this address's scheme.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] when the URI is malformed, the scheme (or a
    /// scheme in the transport chain) is unknown, a physical address has no
    /// port, or the transport chain is cyclic.
    pub fn new_address_with(
        &self,
        uri: &str,
        options: ResourceOptions,
    ) -> Result<ResourceAddress, AddressError> {
        self.build(uri, options, 0)
    }

    /// Creates a primary address carrying the remaining URIs as alternates.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Empty`] for an empty list, otherwise the first
    /// error produced by any URI.
    pub fn new_address_with_alternates(
        &self,
        uris: &[&str],
        options: ResourceOptions,
    ) -> Result<ResourceAddress, AddressError> {
        let (first, rest) = uris.split_first().ok_or(AddressError::Empty)?;
        let primary = self.new_address_with(first, options.clone())?;
        let alternates = rest
            .iter()
            .map(|uri| self.new_address_with(uri, options.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(primary.with_alternates(alternates))
    }

    fn build(
        &self,
        uri: &str,
        options: ResourceOptions,
        depth: usize,
    ) -> Result<ResourceAddress, AddressError> {
        const MAX_DEPTH: usize = 8;
        if depth > MAX_DEPTH {
            return Err(AddressError::TransportCycle(uri.to_string()));
        }

        let parts = split_uri(uri)?;
        let spec = self
            .schemes
            .get(&parts.scheme)
            .ok_or_else(|| AddressError::UnknownScheme(parts.scheme.clone()))?;

        let port = parts.port.or(spec.default_port);
        if spec.requires_port && port.is_none() {
            return Err(AddressError::MissingPort(uri.to_string()));
        }

        let address = ResourceAddress::new(&parts.scheme, &parts.host, port, &parts.path);

        match &spec.kind {
            SchemeKind::Physical => Ok(address.with_options(options)),
            SchemeKind::Layered { transport } => {
                let transport_uri = match &options.transport {
                    Some(explicit) => explicit.clone(),
                    None => {
                        let authority = address.authority();
                        format!("{transport}://{authority}")
                    }
                };
                // The transport inherits listening and idle tuning but never
                // the `transport` override itself.
                let transport_options = ResourceOptions {
                    next_protocol: Some(parts.scheme.clone()),
                    transport: None,
                    bind_override: options.bind_override.clone(),
                    ..ResourceOptions::default()
                };
                let nested = self.build(&transport_uri, transport_options, depth + 1)?;
                Ok(address.with_options(options).with_transport(nested))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
