//! CONNECT tunnel handling with TLS MITM

use rustls::pki_types::ServerName;
use rustls::server::Acceptor;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

use super::connect::{ConnectTarget, Negotiated};
use super::intercept::InterceptionPipeline;
use super::io::PrefixedStream;
use super::relay::DuplexRelay;
use crate::config::InterceptMode;
use crate::error::{Error, Result};
use crate::rules::RuleSet;
use crate::sink::Dispatcher;
use crate::tls::MitmCertificateGenerator;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Upstream client config trusting the Mozilla root set, HTTP/1.1 only.
pub fn default_upstream_tls() -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    upstream_tls_with_roots(root_store)
}

/// Upstream client config trusting exactly `roots`, HTTP/1.1 only.
pub fn upstream_tls_with_roots(roots: RootCertStore) -> Result<ClientConfig> {
    let mut config = ClientConfig::builder_with_provider(crate::tls::crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(format!("Failed to select protocol versions: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Names to put in the leaf: the CONNECT host, plus the SNI when it differs.
pub fn leaf_hosts(connect_host: &str, sni: Option<&str>) -> Vec<String> {
    let mut hosts = vec![connect_host.to_string()];
    if let Some(sni) = sni {
        if !sni.eq_ignore_ascii_case(connect_host) {
            hosts.push(sni.to_string());
        }
    }
    hosts
}

/// Handles established CONNECT tunnels: opaque relay or TLS interception
pub struct TunnelHandler {
    mitm: Arc<MitmCertificateGenerator>,
    rules: Arc<RuleSet>,
    dispatcher: Dispatcher,
    upstream_tls: Arc<ClientConfig>,
    mode: InterceptMode,
    handshake_timeout: Duration,
    max_body_bytes: usize,
}

impl TunnelHandler {
    pub fn new(
        mitm: Arc<MitmCertificateGenerator>,
        rules: Arc<RuleSet>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        Ok(Self {
            mitm,
            rules,
            dispatcher,
            upstream_tls: Arc::new(default_upstream_tls()?),
            mode: InterceptMode::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Inject a custom TLS config for upstream connections (for testing with self-signed certs).
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls = config;
        self
    }

    pub fn with_intercept_mode(mut self, mode: InterceptMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn should_intercept(&self, target: &ConnectTarget) -> bool {
        match self.mode {
            InterceptMode::All => true,
            InterceptMode::Targets => self.rules.is_target_host(&target.host, target.port),
        }
    }

    /// Carry an established tunnel until both sides are done.
    pub async fn run<S>(&self, tunnel: Negotiated<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Negotiated {
            client,
            upstream,
            target,
        } = tunnel;

        if !self.should_intercept(&target) {
            tracing::debug!(target = %target, "Relaying opaque tunnel");
            let stats = DuplexRelay::matched_pair(client, upstream).run().await?;
            tracing::debug!(
                target = %target,
                sent = stats.client_to_upstream,
                received = stats.upstream_to_client,
                "Opaque tunnel closed"
            );
            return Ok(());
        }

        self.run_mitm_tunnel(client, upstream, &target).await
    }

    /// Terminate client TLS with a forged leaf and inspect the plaintext.
    async fn run_mitm_tunnel<S, U>(
        &self,
        client: PrefixedStream<S>,
        upstream: U,
        target: &ConnectTarget,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let start = tokio::time::timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), client),
        )
        .await
        .map_err(|_| Error::tls(format!("Timed out waiting for ClientHello from {}", target)))?
        .map_err(|e| Error::tls(format!("Failed to read ClientHello: {}", e)))?;

        let sni = start.client_hello().server_name().map(str::to_string);
        let hosts = leaf_hosts(&target.host, sni.as_deref());

        // No certificate, no handshake: the client sees the connection drop.
        let server_config = self.mitm.server_config_for_hosts(&hosts)?;

        let client_tls = tokio::time::timeout(
            self.handshake_timeout,
            start.into_stream(Arc::new(server_config)),
        )
        .await
        .map_err(|_| Error::tls(format!("TLS handshake with client for {} timed out", target)))?
        .map_err(|e| Error::tls(format!("Failed to accept TLS from client: {}", e)))?;

        tracing::debug!(host = %target.host, sni = ?sni, "TLS handshake with client complete");

        let upstream_name = sni.unwrap_or_else(|| target.host.clone());
        let server_name = ServerName::try_from(upstream_name.clone())
            .map_err(|e| Error::proxy(format!("Invalid server name '{}': {}", upstream_name, e)))?;
        let upstream_tls = TlsConnector::from(self.upstream_tls.clone())
            .connect(server_name, upstream)
            .await
            .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", upstream_name, e)))?;

        tracing::debug!(host = %upstream_name, "Upstream TLS handshake complete");

        let pipeline =
            InterceptionPipeline::new(self.rules.clone(), self.dispatcher.clone(), self.max_body_bytes);
        pipeline
            .run(client_tls, upstream_tls, &target.host_header())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ProxyTarget;
    use crate::sink::{TracingCaptureSink, TracingNotifier};
    use crate::store::MemoryStore;
    use crate::tls::CertificateAuthority;

    fn handler(rules: RuleSet) -> TunnelHandler {
        let ca = CertificateAuthority::ensure(Arc::new(MemoryStore::new())).unwrap();
        let mitm = Arc::new(MitmCertificateGenerator::new(Arc::new(ca)));
        let (dispatcher, _worker) = Dispatcher::spawn(
            Arc::new(TracingCaptureSink),
            Arc::new(TracingNotifier),
            4,
            1,
        );
        TunnelHandler::new(mitm, Arc::new(rules), dispatcher).unwrap()
    }

    #[test]
    fn test_leaf_hosts() {
        assert_eq!(leaf_hosts("a.com", None), vec!["a.com"]);
        assert_eq!(leaf_hosts("a.com", Some("A.com")), vec!["a.com"]);
        assert_eq!(
            leaf_hosts("10.0.0.1", Some("api.example.com")),
            vec!["10.0.0.1", "api.example.com"]
        );
    }

    #[tokio::test]
    async fn test_intercept_decision() {
        let rules = RuleSet::new(vec![ProxyTarget::new("api.example.com")]).unwrap();
        let targets_only = handler(rules.clone());
        assert!(targets_only.should_intercept(&ConnectTarget::new("api.example.com", 443)));
        assert!(!targets_only.should_intercept(&ConnectTarget::new("other.example.com", 443)));

        let all = handler(rules).with_intercept_mode(InterceptMode::All);
        assert!(all.should_intercept(&ConnectTarget::new("other.example.com", 443)));
    }

    #[test]
    fn test_default_upstream_tls_is_http1() {
        let config = default_upstream_tls().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
