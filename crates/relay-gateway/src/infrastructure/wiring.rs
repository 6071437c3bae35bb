//! Turns a [`GatewayConfig`] into bound services on a [`TransportService`].
//!
//! For every `[[service]]` entry:
//!
//! 1. the service's `protocol` is registered as a [`PrefixLayer`] over its
//!    `transport` scheme (once per protocol name);
//! 2. its `accept` URIs become one address with alternates;
//! 3. that address is bound to an [`EchoHandler`] or [`RelayHandler`].
//!
//! A failure rolls back every service bound so far, so the gateway either
//! starts completely or not at all.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use relay_core::address::ResourceOptions;
use relay_transport::{
    AddressError, BindError, IoHandler, PrefixLayer, ResourceAddress, TransportService,
};

use crate::application::{EchoHandler, RelayHandler};
use crate::domain::config::{GatewayConfig, ServiceConfig, ServiceKind};

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("failed to start the transport service: {0}")]
    Start(#[from] std::io::Error),

    #[error("service '{service}': bad address: {source}")]
    Address {
        service: String,
        #[source]
        source: AddressError,
    },

    #[error("service '{service}': bind failed: {source}")]
    Bind {
        service: String,
        #[source]
        source: BindError,
    },
}

/// A running gateway: the transport service plus what was bound on it.
pub struct Gateway {
    service: TransportService,
    bound: Vec<(String, ResourceAddress)>,
}

impl Gateway {
    /// Starts the transport service and binds every configured service.
    ///
    /// `workers` (from the command line) overrides the file's worker count.
    ///
    /// # Errors
    ///
    /// See [`WiringError`].  Nothing stays bound on error.
    pub async fn start(config: &GatewayConfig, workers: Option<usize>) -> Result<Self, WiringError> {
        let service = TransportService::new(config.transport_config(workers))?;
        let mut gateway = Self {
            service,
            bound: Vec::new(),
        };
        for entry in &config.services {
            if let Err(e) = gateway.bind_service(entry).await {
                gateway.shutdown().await;
                return Err(e);
            }
        }
        info!(services = gateway.bound.len(), "gateway started");
        Ok(gateway)
    }

    pub fn service(&self) -> &TransportService {
        &self.service
    }

    /// Bound services as `(name, address)`, in configuration order.
    pub fn bound(&self) -> &[(String, ResourceAddress)] {
        &self.bound
    }

    async fn bind_service(&mut self, entry: &ServiceConfig) -> Result<(), WiringError> {
        let prefix = entry
            .sniff_prefix
            .as_ref()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .unwrap_or_default();
        let layer = PrefixLayer::new(entry.protocol.as_str(), entry.transport.as_str(), prefix);
        if !self.service.register_layer(Arc::new(layer)) {
            info!(protocol = %entry.protocol, "protocol already registered; reusing it");
        }

        let address_error = |source| WiringError::Address {
            service: entry.name.clone(),
            source,
        };
        let uris: Vec<&str> = entry.accept.iter().map(String::as_str).collect();
        let address = self
            .service
            .address_with_alternates(&uris, ResourceOptions::default())
            .map_err(address_error)?;

        let handler: Arc<dyn IoHandler> = match entry.kind {
            ServiceKind::Echo => Arc::new(EchoHandler::new(entry.name.as_str())),
            ServiceKind::Relay => {
                let connect = entry.connect.as_deref().unwrap_or_default();
                let backend = self.service.address(connect).map_err(address_error)?;
                Arc::new(RelayHandler::new(
                    entry.name.as_str(),
                    self.service.clone(),
                    backend,
                ))
            }
        };

        self.service
            .bind(address.clone(), handler, None)
            .await
            .map_err(|source| WiringError::Bind {
                service: entry.name.clone(),
                source,
            })?;
        info!(
            service = %entry.name,
            %address,
            alternates = address.alternates().len(),
            kind = ?entry.kind,
            "service bound"
        );
        self.bound.push((entry.name.clone(), address));
        Ok(())
    }

    /// Unbinds every service, then disposes the transport service.
    pub async fn shutdown(self) {
        for (name, address) in self.bound.iter().rev() {
            if let Err(error) = self.service.unbind(address.clone()).await {
                warn!(service = %name, %error, "unbind failed during shutdown");
            }
        }
        self.service.dispose().await;
        info!("gateway stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn service(name: &str, protocol: &str, prefix: &str, kind: ServiceKind) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            accept: vec![format!("{protocol}://127.0.0.1:0")],
            protocol: protocol.to_string(),
            sniff_prefix: Some(prefix.to_string()),
            transport: "tcp".to_string(),
            kind,
            connect: None,
        }
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("reply in time")
            .expect("reply read");
        buf
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_service_echoes_sniffed_bytes() {
        // Arrange
        let mut config = GatewayConfig::default();
        config.gateway.workers = Some(2);
        config.services.push(service("echo", "echo", "ECHO", ServiceKind::Echo));
        let gateway = Gateway::start(&config, None).await.expect("gateway starts");
        let address = gateway.bound()[0].1.clone();
        let local = gateway.service().local_addrs(&address)[0];

        // Act
        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"ECHO hello").await.unwrap();

        // Assert
        assert_eq!(read_exactly(&mut client, 10).await, b"ECHO hello");
        gateway.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_service_pipes_both_ways() {
        // Arrange: a plain TCP backend that answers with upper-case text.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            let reply = buf[..n].to_ascii_uppercase();
            stream.write_all(&reply).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut config = GatewayConfig::default();
        config.gateway.workers = Some(2);
        let mut relay = service("relay", "rlay", "RLAY", ServiceKind::Relay);
        relay.connect = Some(format!("tcp://{backend_addr}"));
        config.services.push(relay);
        let gateway = Gateway::start(&config, None).await.expect("gateway starts");
        let local = gateway.service().local_addrs(&gateway.bound()[0].1)[0];

        // Act
        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"RLAY ping").await.unwrap();

        // Assert
        assert_eq!(read_exactly(&mut client, 9).await, b"RLAY PING");
        gateway.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_accept_uri_fails_start() {
        let mut config = GatewayConfig::default();
        config.gateway.workers = Some(1);
        let mut bad = service("bad", "echo", "ECHO", ServiceKind::Echo);
        bad.accept = vec!["echo://127.0.0.1:notaport".to_string()];
        config.services.push(bad);

        let result = Gateway::start(&config, None).await;

        assert!(matches!(result, Err(WiringError::Address { .. })));
    }
}
