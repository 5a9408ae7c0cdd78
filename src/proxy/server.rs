//! Main proxy server

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use super::cert_server::CertificateServer;
use super::connect::{ConnectNegotiator, Outcome, UpstreamDialer};
use super::tunnel::{upstream_tls_with_roots, TunnelHandler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::rules::RuleSet;
use crate::sink::{
    CaptureSink, Dispatcher, JsonlCaptureStore, Notifier, TracingCaptureSink, TracingNotifier,
};
use crate::store::FileStore;
use crate::tls::{CertificateAuthority, MitmCertificateGenerator};

/// Addresses the listeners actually bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddresses {
    pub proxy: SocketAddr,
    pub certificate: SocketAddr,
}

struct Listeners {
    proxy: TcpListener,
    certificate: TcpListener,
}

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    ca: Arc<CertificateAuthority>,
    mitm_generator: Arc<MitmCertificateGenerator>,
    rules: Arc<RuleSet>,
    capture: Arc<dyn CaptureSink>,
    notifier: Arc<dyn Notifier>,
    listeners: Option<Listeners>,
    upstream_port_override: Option<u16>,
    upstream_host_override: Option<String>,
    upstream_tls_config: Option<Arc<ClientConfig>>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration
    pub fn new(config: Config) -> Result<Self> {
        let store = match &config.store.dir {
            Some(dir) => FileStore::open(dir)?,
            None => FileStore::open_default()?,
        };
        tracing::debug!(dir = %store.dir().display(), "Using credential store");
        let ca = CertificateAuthority::ensure(Arc::new(store))?;

        let capture: Arc<dyn CaptureSink> = match &config.logging.capture_log {
            Some(path) => {
                let sink = JsonlCaptureStore::open(path).map_err(|e| {
                    Error::config(format!(
                        "Failed to open capture log '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::info!(path = %path.display(), "Capture log enabled");
                Arc::new(sink)
            }
            None => Arc::new(TracingCaptureSink),
        };

        Self::with_components(config, Arc::new(ca), capture, Arc::new(TracingNotifier))
    }

    /// Create a server around an existing CA and side-effect sinks
    pub fn with_components(
        config: Config,
        ca: Arc<CertificateAuthority>,
        capture: Arc<dyn CaptureSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let rules = Arc::new(config.rule_set()?);
        let mitm_generator = Arc::new(MitmCertificateGenerator::new(ca.clone()));

        let upstream_tls_config = match &config.proxy.upstream_tls_ca {
            Some(path) => Some(Arc::new(load_upstream_tls(path)?)),
            None => None,
        };

        tracing::info!(
            targets = rules.len(),
            intercept = ?config.proxy.intercept,
            "Interception rules loaded"
        );

        Ok(Self {
            upstream_port_override: config.proxy.upstream_override_port,
            upstream_host_override: config.proxy.upstream_override_host.clone(),
            config,
            ca,
            mitm_generator,
            rules,
            capture,
            notifier,
            listeners: None,
            upstream_tls_config,
        })
    }

    /// Override the upstream port for all forwarded connections (for testing).
    pub fn with_upstream_port_override(mut self, port: u16) -> Self {
        self.upstream_port_override = Some(port);
        self
    }

    /// Override the upstream host for TCP connections (for testing with non-resolvable hostnames).
    /// The original hostname is still used for TLS SNI.
    pub fn with_upstream_host_override(mut self, host: String) -> Self {
        self.upstream_host_override = Some(host);
        self
    }

    /// Inject a custom TLS config for upstream connections (for testing with self-signed certs).
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls_config = Some(config);
        self
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let addresses = self.bind().await?;
        tracing::info!(
            address = %addresses.proxy,
            certificate_address = %addresses.certificate,
            "Proxy server listening"
        );
        self.serve(shutdown).await
    }

    /// Bind both listeners and return their addresses.
    ///
    /// Useful when binding to port 0 to discover the assigned ports.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<BoundAddresses> {
        let proxy = bind_listener(self.config.bind_address()?).await?;
        let certificate = bind_listener(self.config.certificate_address()?).await?;

        let addresses = BoundAddresses {
            proxy: local_addr(&proxy)?,
            certificate: local_addr(&certificate)?,
        };
        self.listeners = Some(Listeners { proxy, certificate });
        Ok(addresses)
    }

    /// Serve connections on previously bound listeners until `shutdown` fires.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let Listeners { proxy, certificate } = self
            .listeners
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;

        let (dispatcher, _worker) = Dispatcher::spawn(
            self.capture.clone(),
            self.notifier.clone(),
            self.config.dispatch.queue_capacity,
            self.config.dispatch.max_concurrency,
        );
        let negotiator = Arc::new(self.make_negotiator());
        let tunnel_handler = Arc::new(self.make_tunnel_handler(dispatcher)?);
        let cert_server = CertificateServer::new(self.ca.clone());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = proxy.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    spawn_connection(stream, client_addr, &negotiator, &tunnel_handler);
                }
                result = certificate.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept certificate connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "Certificate download connection");
                    let cert_server = cert_server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = cert_server.serve_connection(stream).await {
                            log_connection_error(&client_addr, &e);
                        }
                    });
                }
            }
        }
    }

    fn make_negotiator(&self) -> ConnectNegotiator {
        ConnectNegotiator::new(
            UpstreamDialer::new(self.config.proxy.connect_timeout())
                .with_host_override(self.upstream_host_override.clone())
                .with_port_override(self.upstream_port_override),
        )
        .with_head_timeout(self.config.proxy.head_timeout())
    }

    fn make_tunnel_handler(&self, dispatcher: Dispatcher) -> Result<TunnelHandler> {
        let mut handler =
            TunnelHandler::new(self.mitm_generator.clone(), self.rules.clone(), dispatcher)?
                .with_intercept_mode(self.config.proxy.intercept)
                .with_handshake_timeout(self.config.proxy.handshake_timeout())
                .with_max_body_bytes(self.config.proxy.max_body_bytes);
        if let Some(ref tls_config) = self.upstream_tls_config {
            handler = handler.with_upstream_tls(tls_config.clone());
        }
        Ok(handler)
    }
}

/// Spawn a task to handle a single proxy connection.
fn spawn_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    negotiator: &Arc<ConnectNegotiator>,
    tunnel_handler: &Arc<TunnelHandler>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let negotiator = negotiator.clone();
    let tunnel_handler = tunnel_handler.clone();

    tokio::spawn(async move {
        let tunnel = match negotiator.negotiate(stream).await {
            Ok(Outcome::Established(tunnel)) => tunnel,
            Ok(Outcome::Rejected(status)) => {
                tracing::debug!(client = %client_addr, status = status.as_u16(), "Connection rejected");
                return;
            }
            Err(e) => {
                log_connection_error(&client_addr, &e);
                return;
            }
        };

        let target = tunnel.target.clone();
        if let Err(e) = tunnel_handler.run(tunnel).await {
            if e.is_disconnect() {
                tracing::debug!(client = %client_addr, target = %target, error = %e, "Tunnel closed");
            } else {
                tracing::warn!(client = %client_addr, target = %target, error = %e, "Tunnel failed");
            }
        }
    });
}

fn log_connection_error(client_addr: &SocketAddr, e: &Error) {
    // Connection closed errors are normal
    tracing::debug!(client = %client_addr, error = %e, "Connection ended");
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))
}

/// Upstream TLS config trusting only the certificates in a PEM file.
fn load_upstream_tls(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let path = path.as_ref();
    let pem = std::fs::read(path).map_err(|e| {
        Error::config(format!(
            "Failed to read upstream_tls_ca '{}': {}",
            path.display(),
            e
        ))
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::config(format!("Invalid PEM in '{}': {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::config(format!("Unusable upstream CA certificate: {}", e)))?;
    }
    upstream_tls_with_roots(roots)
}
